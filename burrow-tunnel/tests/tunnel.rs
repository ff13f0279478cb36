//! Full tunnel sessions over loopback: forwarder and server endpoints with a
//! minted mutual-TLS chain, bridging to a local origin.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use burrow_tunnel::{
    address::TargetAddress,
    app::AppContext,
    forwarder::{run_forwarder, Remote},
    server::run_server,
    tls,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::LocalSet,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(10);

struct TestCerts {
    _dir: tempfile::TempDir,
    root_ca: PathBuf,
    server_cert: PathBuf,
    server_key: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
}

fn mint_certs() -> TestCerts {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let client_key = KeyPair::generate().unwrap();
    let client_params = CertificateParams::new(vec!["forwarder".to_string()]).unwrap();
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, contents: String| {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    };

    TestCerts {
        root_ca: write("ca.pem", ca_cert.pem()),
        server_cert: write("server.pem", server_cert.pem()),
        server_key: write("server.key", server_key.serialize_pem()),
        client_cert: write("client.pem", client_cert.pem()),
        client_key: write("client.key", client_key.serialize_pem()),
        _dir: dir,
    }
}

/// Starts a tunnel server and a forwarder pointed at it, both on ephemeral
/// loopback ports, and returns the forwarder's address.
async fn start_stack(certs: &TestCerts) -> (SocketAddr, AppContext) {
    let ctx = AppContext::new();

    let server_tls = tls::server_config(&certs.server_cert, &certs.server_key, Some(&certs.root_ca)).unwrap();
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap();
    let server_ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        let _ = run_server(server_listener, server_tls, server_ctx).await;
    });

    let (client_tls, server_name) = tls::client_config(
        Some(&certs.root_ca),
        &certs.client_cert,
        &certs.client_key,
        "localhost",
        false,
    )
    .unwrap();
    let target = TargetAddress::from_url(&format!("https://127.0.0.1:{}", server_addr.port())).unwrap();
    let remote = Remote::new(&target, client_tls, server_name);

    let forwarder_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let forwarder_addr = forwarder_listener.local_addr().unwrap();
    let forwarder_ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        let _ = run_forwarder(forwarder_listener, remote, forwarder_ctx).await;
    });

    (forwarder_addr, ctx)
}

#[tokio::test]
async fn connect_tunnel_roundtrip() {
    let certs = mint_certs();
    let local = LocalSet::new();

    timeout(Duration::from_secs(60), local.run_until(async move {
        // An echo origin: mirrors bytes until EOF.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (forwarder_addr, _ctx) = start_stack(&certs).await;

        let mut client = TcpStream::connect(forwarder_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut ok = [0u8; 19];
        timeout(WAIT, client.read_exact(&mut ok)).await.unwrap().unwrap();
        assert_eq!(&ok, b"HTTP/1.1 200 OK\r\n\r\n");

        // Two volleys prove the tunnel is interactive in both directions.
        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut echo)).await.unwrap().unwrap();
        assert_eq!(&echo, b"ping");

        client.write_all(b"pong!").await.unwrap();
        let mut echo = [0u8; 5];
        timeout(WAIT, client.read_exact(&mut echo)).await.unwrap().unwrap();
        assert_eq!(&echo, b"pong!");

        // Half-close: our FIN travels to the origin, which closes; its EOF
        // travels back.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn absolute_form_get_replays_request() {
    let certs = mint_certs();
    let local = LocalSet::new();

    timeout(Duration::from_secs(60), local.run_until(async move {
        // A capturing origin: records the request head, sends a fixed
        // response, closes.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let (captured_tx, captured_rx) = tokio::sync::oneshot::channel();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 256];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = captured_tx.send(request);
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await;
        });

        let (forwarder_addr, _ctx) = start_stack(&certs).await;

        let mut client = TcpStream::connect(forwarder_addr).await.unwrap();
        client
            .write_all(format!("GET http://{origin_addr}/path HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        // No local acknowledgement for absolute-form requests; the origin's
        // response comes straight through.
        let mut response = Vec::new();
        timeout(WAIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response:?}");
        assert!(response.ends_with("ok"), "{response:?}");

        // The origin saw the reconstructed request line plus the (lowercased)
        // headers.
        let captured = String::from_utf8(captured_rx.await.unwrap()).unwrap();
        assert!(
            captured.starts_with(&format!("GET http://{origin_addr}/path HTTP/1.1\r\n")),
            "{captured:?}"
        );
        assert!(captured.contains(&format!("host: {origin_addr}\r\n")), "{captured:?}");
        assert!(captured.ends_with("\r\n\r\n"), "{captured:?}");
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn unsupported_method_closes_connection() {
    let certs = mint_certs();
    let local = LocalSet::new();

    timeout(Duration::from_secs(60), local.run_until(async move {
        let (forwarder_addr, _ctx) = start_stack(&certs).await;

        let mut client = TcpStream::connect(forwarder_addr).await.unwrap();
        client
            .write_all(b"DELETE http://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        // The tunnel never speaks HTTP errors; the connection just closes.
        let mut response = Vec::new();
        timeout(WAIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
        assert!(response.is_empty());
    }))
    .await
    .unwrap();
}
