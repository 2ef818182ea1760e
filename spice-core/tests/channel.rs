//! Channel lifecycle, control messages and flow control against a
//! scripted server on localhost.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{PlainSealer, accept, eventually, listener, next_event, refuse};
use spice_core::message::{ClientControl, ControlMessage};
use spice_core::protocol::control::{
    AckSync, Disconnecting, Ping, SetAck, WaitEntry, encode_wait_for_channels,
};
use spice_core::{
    Channel, ChannelConfig, ChannelContext, ChannelEnv, ChannelHandler, ChannelIdentity,
    ChannelState, ChannelType, ClientEvent, ConnectionOptions, ErrorCode, HandlerTable,
    InMessage, OutMessage, SpiceError, Target, event_channel,
};
use tokio::sync::mpsc;

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Default, Clone)]
struct Recorder {
    seen: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<(u16, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }
}

fn record(s: &mut Recorder, _ctx: &mut ChannelContext<'_>, m: &InMessage) -> Result<(), SpiceError> {
    s.seen.lock().unwrap().push((m.msg_type(), m.data().to_vec()));
    Ok(())
}

impl ChannelHandler for Recorder {
    fn handler_table() -> HandlerTable<Self> {
        let mut t = HandlerTable::new();
        t.register(101, 0, record).unwrap();
        t.register(102, 4, record).unwrap();
        t
    }
}

fn inputs() -> ChannelIdentity {
    ChannelIdentity::new(ChannelType::Inputs, 0)
}

fn env_for(target: Target) -> (Arc<ChannelEnv>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (events, rx) = event_channel();
    let env = ChannelEnv::new(
        ChannelConfig::default(),
        ConnectionOptions::default(),
        target,
        "secret",
        Arc::new(PlainSealer),
        events,
    );
    (Arc::new(env), rx)
}

fn local(port: u16) -> Target {
    Target::new("127.0.0.1", Some(port), None)
}

async fn connected(channel: &Channel) {
    tokio::time::timeout(
        common::STEP,
        channel.wait_for_state(|s| *s == ChannelState::Connected),
    )
    .await
    .expect("channel never connected")
    .unwrap();
}

// ── Link and control messages ────────────────────────────────────

#[tokio::test]
async fn links_and_answers_ping() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder, env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    assert_eq!(server.link.channel_type, ChannelType::Inputs as u8);
    assert_eq!(server.link.connection_id, 0);
    assert_eq!(&server.ticket[..6], b"secret");
    connected(&channel).await;

    let ping = Ping {
        id: 5,
        timestamp: 0xDEAD_BEEF,
    };
    server.send_encoded(ControlMessage::Ping as u16, &ping).await;
    let body = server.recv_type(ClientControl::Pong as u16).await;
    assert_eq!(Ping::decode(&body).unwrap(), ping);

    channel.abort().await;
    assert_eq!(channel.state(), ChannelState::Terminated);
}

#[tokio::test]
async fn handler_messages_are_dispatched_and_recorded_for_sync() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder.clone(), env.clone());

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    server.send(101, &[1, 2]).await;
    server.send(102, &[3, 4, 5, 6]).await;
    eventually(|| recorder.seen().len() == 2).await;
    assert_eq!(recorder.seen(), vec![(101, vec![1, 2]), (102, vec![3, 4, 5, 6])]);
    assert_eq!(env.sync.serial(inputs()), 2);
    assert_eq!(channel.stats().messages_received, 2);

    channel.abort().await;
}

#[tokio::test]
async fn set_ack_limits_unacked_messages() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    server
        .send_encoded(
            ControlMessage::SetAck as u16,
            &SetAck {
                generation: 3,
                window: 2,
            },
        )
        .await;
    let body = server.recv_type(ClientControl::AckSync as u16).await;
    assert_eq!(body, AckSync { generation: 3 }.encode().unwrap());

    for i in 0..3u8 {
        channel.post_message(OutMessage::new(110, vec![i])).unwrap();
    }
    assert_eq!(server.recv_type(110).await, vec![0]);
    assert_eq!(server.recv_type(110).await, vec![1]);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), server.recv())
            .await
            .is_err(),
        "third message sent without an ack"
    );
    eventually(|| channel.stats().unacked == 2).await;
    assert_eq!(channel.stats().window, 2);

    server.send(ControlMessage::Ack as u16, &[]).await;
    assert_eq!(server.recv_type(110).await, vec![2]);

    channel.abort().await;
}

#[tokio::test]
async fn acks_every_window_inbound_messages() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder.clone(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    server
        .send_encoded(
            ControlMessage::SetAck as u16,
            &SetAck {
                generation: 1,
                window: 2,
            },
        )
        .await;
    server.recv_type(ClientControl::AckSync as u16).await;

    server.send(101, &[]).await;
    server.send(101, &[]).await;
    let (_, ty, body) = server.recv().await;
    assert_eq!(ty, ClientControl::Ack as u16);
    assert!(body.is_empty());
    assert_eq!(recorder.seen().len(), 2);

    channel.abort().await;
}

#[tokio::test]
async fn wait_for_channels_holds_dispatch() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder.clone(), env.clone());

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    let display = ChannelIdentity::new(ChannelType::Display, 0);
    let wait = encode_wait_for_channels(&[WaitEntry {
        channel_type: ChannelType::Display,
        channel_id: 0,
        serial: 4,
    }])
    .unwrap();
    server.send(ControlMessage::WaitForChannels as u16, &wait).await;
    server.send(101, &[7]).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.seen().is_empty());

    env.sync.update(display, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.seen().is_empty());

    env.sync.update(display, 4);
    eventually(|| recorder.seen() == vec![(101, vec![7])]).await;

    channel.abort().await;
}

// ── Disconnects and errors ───────────────────────────────────────

#[tokio::test]
async fn unregistered_type_is_fatal() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    server.send(150, &[]).await;
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ConnectionError(ErrorCode::Protocol)
    );
    server.expect_closed().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn short_body_is_fatal() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder.clone(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    server.send(102, &[1, 2]).await;
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ConnectionError(ErrorCode::Protocol)
    );
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn peer_close_reports_one_disconnect_and_channel_reconnects() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let recorder = Recorder::default();
    let channel = Channel::new(inputs(), recorder.clone(), env.clone());

    channel.connect().unwrap();
    let server = accept(&listener).await;
    connected(&channel).await;

    drop(server);
    assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
    channel
        .wait_for_state(|s| *s == ChannelState::Disconnected)
        .await
        .unwrap();

    // Posted while disconnected; delivered on the next connection.
    channel.post_message(OutMessage::new(120, vec![9])).unwrap();
    env.arm_disconnect();
    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;
    assert_eq!(server.recv_type(120).await, vec![9]);

    server.send(101, &[]).await;
    eventually(|| recorder.seen().len() == 1).await;
    assert!(events.try_recv().is_err());

    channel.abort().await;
}

#[tokio::test]
async fn requested_disconnect_says_goodbye() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;

    channel.disconnect().await;
    let body = server.recv_type(ClientControl::Disconnecting as u16).await;
    assert_eq!(body.len(), Disconnecting::SIZE);
    server.expect_closed().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn link_refusal_is_reported() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    // NeedSecured with no secure port to fall back to.
    refuse(&listener, 5).await;
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ConnectionError(ErrorCode::LinkFailure)
    );
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn refused_connection_is_a_connect_failure() {
    let (listener, port) = listener().await;
    drop(listener);
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ConnectionError(ErrorCode::ConnectFailure)
    );
}

#[tokio::test]
async fn abort_while_linking_is_final() {
    let (listener, port) = listener().await;
    let (env, mut events) = env_for(local(port));
    env.arm_disconnect();
    let channel = Arc::new(Channel::new(inputs(), Recorder::default(), env));

    channel.connect().unwrap();
    // Accept but never answer the link.
    let (_stream, _) = listener.accept().await.unwrap();

    let a = tokio::spawn({
        let channel = channel.clone();
        async move { channel.abort().await }
    });
    let b = tokio::spawn({
        let channel = channel.clone();
        async move { channel.abort().await }
    });
    tokio::time::timeout(common::STEP, async {
        a.await.unwrap();
        b.await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(channel.state(), ChannelState::Terminated);
    assert!(matches!(channel.connect(), Err(SpiceError::Aborted)));
    assert!(matches!(
        channel.post_message(OutMessage::empty(101)),
        Err(SpiceError::ChannelClosed)
    ));
    assert!(events.try_recv().is_err());
}

// ── Flow control and ordering ────────────────────────────────────

#[tokio::test]
async fn eleventh_send_waits_for_ack_bunch() {
    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;
    server
        .send_encoded(
            ControlMessage::SetAck as u16,
            &SetAck {
                generation: 1,
                window: 10,
            },
        )
        .await;
    server.recv_type(ClientControl::AckSync as u16).await;

    for i in 0..11u8 {
        channel.post_message(OutMessage::new(110, vec![i])).unwrap();
    }
    for i in 0..10u8 {
        assert_eq!(server.recv_type(110).await, vec![i]);
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), server.recv())
            .await
            .is_err(),
        "eleventh message sent without an ack"
    );
    assert_eq!(channel.stats().unacked, 10);

    server.send(ControlMessage::Ack as u16, &[]).await;
    assert_eq!(server.recv_type(110).await, vec![10]);
    eventually(|| channel.stats().unacked == 1).await;

    channel.abort().await;
}

#[tokio::test]
async fn posts_keep_per_producer_order() {
    const PRODUCERS: u8 = 4;
    const EACH: u8 = 25;

    let (listener, port) = listener().await;
    let (env, _events) = env_for(local(port));
    let channel = Channel::new(inputs(), Recorder::default(), env);

    channel.connect().unwrap();
    let mut server = accept(&listener).await;
    connected(&channel).await;
    server
        .send_encoded(
            ControlMessage::SetAck as u16,
            &SetAck {
                generation: 1,
                window: 1000,
            },
        )
        .await;
    server.recv_type(ClientControl::AckSync as u16).await;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let poster = channel.poster();
            tokio::spawn(async move {
                for seq in 0..EACH {
                    poster.post(OutMessage::new(110, vec![p, seq])).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in futures::future::join_all(producers).await {
        producer.unwrap();
    }

    let mut next = [0u8; PRODUCERS as usize];
    let mut last_serial = 0;
    for _ in 0..(PRODUCERS as usize * EACH as usize) {
        let (serial, ty, body) = server.recv().await;
        assert_eq!(ty, 110);
        assert!(serial > last_serial);
        last_serial = serial;
        let (p, seq) = (body[0] as usize, body[1]);
        assert_eq!(seq, next[p], "producer {p} out of order");
        next[p] += 1;
    }
    assert!(next.iter().all(|&n| n == EACH));

    channel.abort().await;
}
