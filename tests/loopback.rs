//! Full sessions against a server on a loopback listener

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdphost::protocol::channel::Channel;
use rdphost::protocol::messages::{Packet, PacketType};
use rdphost::protocol::payloads::{self, CapabilitiesReply, ControlCommand};
use rdphost::protocol::session::SessionSummary;
use rdphost::{RdpClient, RdpError, RdpServer, SendOptions, ServerConfig, SessionObserver};

#[derive(Default)]
struct Counters {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    data_bytes: AtomicUsize,
}

#[async_trait]
impl SessionObserver for Counters {
    async fn on_connected(&self, _session: &SessionSummary) -> Result<(), RdpError> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_disconnected(&self, _session: &SessionSummary) -> Result<(), RdpError> {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_data(
        &self,
        _session: &SessionSummary,
        _channel: &Channel,
        packet: &Packet,
    ) -> Result<(), RdpError> {
        self.data_bytes.fetch_add(packet.payload.len(), Ordering::SeqCst);
        Ok(())
    }
}

async fn start_server(observer: Arc<Counters>) -> Arc<RdpServer> {
    let config = ServerConfig::from_pairs([
        ("RDP_HOST", "127.0.0.1"),
        ("RDP_PORT", "0"),
        ("RDP_CLIPBOARD_ENABLED", "true"),
        ("RDP_AUDIO_ENABLED", "false"),
    ])
    .unwrap();

    let server = Arc::new(RdpServer::bind(config).await.unwrap().with_observer(observer));
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    server
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_end_to_end_session() {
    let observer = Arc::new(Counters::default());
    let server = start_server(observer.clone()).await;
    let registry = server.registry();

    let mut client = RdpClient::connect(server.local_addr().unwrap()).await.unwrap();

    let response = client.negotiate(&["compression", "clipboard"]).await.unwrap();
    assert_eq!(response.status, "success");
    assert_eq!(response.capabilities, vec!["compression", "clipboard"]);

    let auth = client.authenticate("alice", "secret", "CORP").await.unwrap();
    assert!(auth.success);
    assert!(client.session_key().is_some());

    let channels = client.read_channels().await.unwrap();
    let ids: Vec<u16> = channels.channels.iter().map(|c| c.channel_id).collect();
    assert_eq!(ids, vec![1, 2, 4]);
    let types: Vec<&str> = channels.channels.iter().map(|c| c.channel_type.as_str()).collect();
    assert_eq!(types, vec!["control", "data", "clipboard"]);

    wait_until(|| observer.connected.load(Ordering::SeqCst) == 1).await;
    let summary = &registry.snapshot().active_sessions[0];
    assert_eq!(summary.username, "alice");
    assert!(summary.session_id.starts_with("rdp_session_"));

    // Encrypted and compressed clipboard data reaches observers as plaintext
    let text = b"hello from the clipboard".repeat(4);
    client
        .send_data(
            4,
            &text,
            SendOptions {
                encrypt: true,
                compress: true,
            },
        )
        .await
        .unwrap();
    wait_until(|| observer.data_bytes.load(Ordering::SeqCst) == text.len()).await;

    client
        .send_control(&ControlCommand::RequestCapabilities)
        .await
        .unwrap();
    let reply = client.expect(PacketType::Data).await.unwrap();
    let caps: CapabilitiesReply = payloads::parse("test", &reply.payload).unwrap();
    assert_eq!(caps.capabilities, vec!["compression", "clipboard"]);

    client.send_heartbeat().await.unwrap();
    let heartbeat = client.expect(PacketType::Heartbeat).await.unwrap();
    assert_eq!(heartbeat.channel_id, 1);

    client.disconnect().await.unwrap();
    wait_until(|| registry.active_count() == 0).await;
    assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);

    let stats = registry.snapshot();
    assert_eq!(stats.connections_total, 1);
    assert_eq!(stats.connections_active, 0);
    // request, credentials, data, control, heartbeat, disconnect
    assert_eq!(stats.packets_received, 6);
    assert!(stats.packets_sent >= 5);
}

#[tokio::test]
async fn test_rejected_credentials_close_session() {
    let observer = Arc::new(Counters::default());
    let server = start_server(observer.clone()).await;
    let registry = server.registry();

    let mut client = RdpClient::connect(server.local_addr().unwrap()).await.unwrap();
    client.negotiate(&["clipboard"]).await.unwrap();

    let auth = client.authenticate("mallory", "", "").await.unwrap();
    assert!(!auth.success);
    assert!(auth.encryption_key.is_none());
    assert!(client.session_key().is_none());

    // No channel list follows; the server hangs up
    assert!(client.read_channels().await.is_err());

    wait_until(|| registry.active_count() == 0).await;
    assert_eq!(observer.connected.load(Ordering::SeqCst), 0);
    assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_active_sessions() {
    let server = start_server(Arc::new(Counters::default())).await;
    let registry = server.registry();

    let mut client = RdpClient::connect(server.local_addr().unwrap()).await.unwrap();
    client.negotiate(&[]).await.unwrap();
    client.authenticate("bob", "hunter2", "").await.unwrap();
    let channels = client.read_channels().await.unwrap();
    assert_eq!(channels.channels.len(), 2);

    assert_eq!(server.shutdown().await, 1);
    assert_eq!(registry.active_count(), 0);
    assert!(client.recv().await.is_err());
}
