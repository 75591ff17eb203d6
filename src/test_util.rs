//! Shared helpers for loopback tests

use crate::link::{DeviceLink, LinkEvent};
use crate::transport::TlsConnection;
use crate::trust::CertificateInfo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Establish a TLS connection pair over loopback with inverted roles
///
/// The first connection belongs to `id_a` (its peer is `id_b`), the second
/// to `id_b`.
pub async fn tls_pair(id_a: &str, id_b: &str) -> (TlsConnection, TlsConnection) {
    let cert_a = CertificateInfo::generate(id_a).unwrap();
    let cert_b = CertificateInfo::generate(id_b).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let id_b_owned = id_b.to_string();
    let accept_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        TlsConnection::upgrade_client(stream, &cert_a, id_b_owned)
            .await
            .unwrap()
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let conn_b = TlsConnection::upgrade_server(stream, &cert_b, id_a.to_string())
        .await
        .unwrap();
    let conn_a = accept_task.await.unwrap();

    (conn_a, conn_b)
}

/// Spawn a link from `local_id` to `remote_id` and hand back the remote end
pub async fn loopback_link(
    local_id: &str,
    remote_id: &str,
) -> (
    DeviceLink,
    mpsc::UnboundedReceiver<LinkEvent>,
    TlsConnection,
) {
    let (conn_local, conn_remote) = tls_pair(local_id, remote_id).await;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let link = DeviceLink::spawn(conn_local, event_tx);
    (link, event_rx, conn_remote)
}
