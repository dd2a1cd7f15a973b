// Jackson Coxson
//! Seed scenario: a `launchSuspendedProcessWithDevicePath:...` reply carrying
//! an integer pid should come back out of `ProcessControlClient::launch_app`.

#![cfg(feature = "dtx")]

use idevice::dtx::{AuxBuffer, AuxValue, DtxConnection, DtxMessage};
use idevice::services::instruments::ProcessControlClient;
use tokio::io::{AsyncWriteExt, DuplexStream};

async fn respond_to_handshake(peer: &mut DuplexStream) {
    let handshake = DtxMessage::read(peer).await.unwrap();
    assert_eq!(
        handshake.selector().as_deref(),
        Some("_notifyOfPublishedCapabilities:")
    );
    let reply = DtxMessage::raw_archive(0, handshake.message_id, 1, Vec::new(), false);
    peer.write_all(&reply.serialize()).await.unwrap();
    peer.flush().await.unwrap();
}

#[tokio::test]
async fn launch_app_returns_the_devices_reported_pid() {
    let (client, mut peer) = tokio::io::duplex(64 * 1024);

    let connect = tokio::spawn(async move { DtxConnection::connect(Box::new(client)).await });
    respond_to_handshake(&mut peer).await;
    let connection = connect.await.unwrap().unwrap();

    let make_client = tokio::spawn({
        let connection = connection.clone();
        async move { ProcessControlClient::new(connection).await }
    });

    let channel_request = DtxMessage::read(&mut peer).await.unwrap();
    assert_eq!(
        channel_request.selector().as_deref(),
        Some("_requestChannelWithCode:identifier:")
    );
    let reply = DtxMessage::raw_archive(0, channel_request.message_id, 1, Vec::new(), false);
    peer.write_all(&reply.serialize()).await.unwrap();
    peer.flush().await.unwrap();

    let mut process_control = make_client.await.unwrap().unwrap();

    let launch = tokio::spawn(async move {
        process_control
            .launch_app("com.example.app", None, None, true, true)
            .await
    });

    let launch_request = DtxMessage::read(&mut peer).await.unwrap();
    assert_eq!(
        launch_request.selector().as_deref(),
        Some(
            "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:"
        )
    );
    let mut reply = DtxMessage::raw_archive(
        launch_request.channel_id,
        launch_request.message_id,
        1,
        Vec::new(),
        false,
    );
    reply.aux = AuxBuffer::new().push(AuxValue::I64(4242));
    peer.write_all(&reply.serialize()).await.unwrap();
    peer.flush().await.unwrap();

    let pid = launch.await.unwrap().unwrap();
    assert_eq!(pid, 4242);
}
