/**
 * tests/session_tests.rs
 *
 * Drives the session state machine tick by tick against a scripted
 * channel: full two-server handshake, pairing, streaming, and the
 * failure paths around each of them.
 */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lodestone::channel::{Channel, ChannelError};
use lodestone::protocol::{
    decrypt_nonce, derive_session_key, encrypt_nonce, password_hash, HashKind, NetMessage,
    SessionKey, PROTOCOL_VERSION, RESULT_DENIED, RESULT_OK, SALT_SIZE,
};
use lodestone::session::{SessionMachine, SessionState, TICK_WAIT};
use lodestone::{
    EventSink, LocationBroker, LocationCache, LocationResponse, ServerConfig,
};

const ACCOUNT_MAIL: &str = "user@example.com";
const ACCOUNT_PASSWORD: &str = "hunter2";
const DEVICE_KEY: &str = "device-0001";
const DEVICE_PASSWORD: &str = "device-secret";
const CHANNEL: &str = "user.location";

fn test_config() -> ServerConfig {
    ServerConfig {
        account_mail: ACCOUNT_MAIL.to_string(),
        account_password: ACCOUNT_PASSWORD.to_string(),
        device_key: DEVICE_KEY.to_string(),
        device_password: DEVICE_PASSWORD.to_string(),
        connection_address: "10.0.0.1".to_string(),
        connection_port: 16096,
        channel: CHANNEL.to_string(),
        timeout: Duration::from_secs(5),
        retry_wait: Duration::from_secs(5),
        update_interval: Duration::from_secs(1),
    }
}

/// Scripted peer state shared between the test and the channel.
#[derive(Default)]
struct Script {
    connected: bool,
    /// Outcomes for upcoming dials; empty means success.
    connect_results: VecDeque<bool>,
    /// Every endpoint the machine dialed, in order.
    dials: Vec<(String, u16)>,
    /// Every message the machine sent, in order.
    sent: Vec<NetMessage>,
    /// Messages queued for the machine to receive.
    inbound: VecDeque<NetMessage>,
}

#[derive(Clone)]
struct ScriptChannel(Arc<Mutex<Script>>);

impl ScriptChannel {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Script::default())))
    }

    fn push(&self, message: NetMessage) {
        self.0.lock().unwrap().inbound.push_back(message);
    }

    fn fail_next_connects(&self, count: usize) {
        let mut script = self.0.lock().unwrap();
        for _ in 0..count {
            script.connect_results.push_back(false);
        }
    }

    fn drop_connection(&self) {
        self.0.lock().unwrap().connected = false;
    }

    fn sent(&self) -> Vec<NetMessage> {
        self.0.lock().unwrap().sent.clone()
    }

    fn last_sent(&self) -> NetMessage {
        self.0.lock().unwrap().sent.last().cloned().expect("nothing sent")
    }

    fn dials(&self) -> Vec<(String, u16)> {
        self.0.lock().unwrap().dials.clone()
    }
}

#[async_trait]
impl Channel for ScriptChannel {
    async fn connect(
        &mut self,
        address: &str,
        port: u16,
        _timeout: Duration,
    ) -> Result<(), ChannelError> {
        let mut script = self.0.lock().unwrap();
        script.dials.push((address.to_string(), port));

        let success = script.connect_results.pop_front().unwrap_or(true);
        if success {
            script.connected = true;
            Ok(())
        } else {
            script.connected = false;
            Err(ChannelError::ConnectFailed("refused".to_string()))
        }
    }

    async fn disconnect(&mut self, _timeout: Duration) {
        let mut script = self.0.lock().unwrap();
        script.connected = false;
        script.inbound.clear();
    }

    fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    async fn send(&mut self, message: &NetMessage) -> Result<(), ChannelError> {
        let mut script = self.0.lock().unwrap();
        if !script.connected {
            return Err(ChannelError::NotConnected);
        }
        script.sent.push(message.clone());
        Ok(())
    }

    fn recv(&mut self, _key: Option<&SessionKey>) -> Result<Option<NetMessage>, ChannelError> {
        Ok(self.0.lock().unwrap().inbound.pop_front())
    }
}

fn machine(
    config: ServerConfig,
) -> (SessionMachine<ScriptChannel>, ScriptChannel, Arc<LocationCache>) {
    let script = ScriptChannel::new();
    let cache = Arc::new(LocationCache::new());
    let machine = SessionMachine::new(Arc::new(config), script.clone(), Arc::clone(&cache));
    (machine, script, cache)
}

fn challenge(salt: [u8; SALT_SIZE], nonce: u32, kind: HashKind) -> NetMessage {
    NetMessage::AuthChallenge {
        salt,
        nonce,
        hash_kind: kind.as_u8(),
    }
}

fn location(latitude: f64, timestamp_ms: u64) -> NetMessage {
    NetMessage::LocationUpdate {
        latitude,
        longitude: 13.2,
        elevation: 10.0,
        facing: 90.0,
        timestamp_ms,
    }
}

/// Walk one server auth exchange: request, challenge, proof, result.
/// Verifies the proof against the expected salted password hash.
async fn run_auth_exchange(
    machine: &mut SessionMachine<ScriptChannel>,
    script: &ScriptChannel,
    kind: HashKind,
) {
    // Send the auth request.
    machine.tick().await;
    match script.last_sent() {
        NetMessage::AuthRequest {
            mail,
            device_key,
            version,
            ..
        } => {
            assert_eq!(mail, ACCOUNT_MAIL);
            assert_eq!(device_key, DEVICE_KEY);
            assert_eq!(version, PROTOCOL_VERSION);
        }
        other => panic!("expected auth request, got {:?}", other),
    }

    // Challenge in, proof out.
    let salt: [u8; SALT_SIZE] = rand::random();
    let nonce: u32 = rand::random();
    script.push(challenge(salt, nonce, kind));
    machine.tick().await;

    match script.last_sent() {
        NetMessage::AuthProof { proof } => {
            let key = password_hash(ACCOUNT_PASSWORD, &salt, kind);
            assert_eq!(decrypt_nonce(&proof, &key).unwrap(), nonce);
        }
        other => panic!("expected auth proof, got {:?}", other),
    }

    // Accept.
    script.push(NetMessage::AuthResult { result: RESULT_OK });
    machine.tick().await;
}

/// Walk the machine from cold start to `AwaitPairing`.
async fn run_to_await_pairing(
    machine: &mut SessionMachine<ScriptChannel>,
    script: &ScriptChannel,
) {
    machine.tick().await;
    assert_eq!(machine.state(), SessionState::AuthRequestPrimary);

    run_auth_exchange(machine, script, HashKind::Blake3).await;
    assert_eq!(machine.state(), SessionState::ChannelRequest);

    machine.tick().await;
    assert_eq!(
        script.last_sent(),
        NetMessage::ChannelRequest {
            channel: CHANNEL.to_string()
        }
    );

    script.push(NetMessage::ChannelResponse {
        channel: CHANNEL.to_string(),
        address: "10.0.0.2".to_string(),
        port: 17000,
    });
    machine.tick().await;
    assert_eq!(machine.state(), SessionState::ConnectSecondary);

    machine.tick().await;
    assert_eq!(machine.state(), SessionState::AuthRequestSecondary);

    run_auth_exchange(machine, script, HashKind::Sha3).await;
    assert_eq!(machine.state(), SessionState::AwaitPairing);
}

/// Complete a pairing exchange with a valid proof; returns the
/// challenge nonce that was issued.
async fn run_pairing(
    machine: &mut SessionMachine<ScriptChannel>,
    script: &ScriptChannel,
) -> u32 {
    script.push(NetMessage::PairRequest { role: 1 });
    machine.tick().await;

    let nonce = match script.last_sent() {
        NetMessage::PairChallenge { nonce, .. } => nonce,
        other => panic!("expected pair challenge, got {:?}", other),
    };
    assert_eq!(machine.state(), SessionState::PairProofWait);

    let proof = encrypt_nonce(nonce, &derive_session_key(DEVICE_PASSWORD)).unwrap();
    script.push(NetMessage::PairProof {
        device_key: DEVICE_KEY.to_string(),
        proof,
    });
    machine.tick().await;

    assert_eq!(
        script.last_sent(),
        NetMessage::PairResult { result: RESULT_OK }
    );
    assert_eq!(machine.state(), SessionState::Streaming);
    nonce
}

#[tokio::test]
async fn full_handshake_reaches_streaming() {
    let (mut machine, script, cache) = machine(test_config());

    run_to_await_pairing(&mut machine, &script).await;
    run_pairing(&mut machine, &script).await;

    assert!(machine.is_paired());
    assert_eq!(
        script.dials(),
        vec![
            ("10.0.0.1".to_string(), 16096),
            ("10.0.0.2".to_string(), 17000),
        ]
    );

    // First fix lands in the cache with exactly the sent fields.
    script.push(location(52.1, 100));
    machine.tick().await;

    let (fix, fresh) = cache.read();
    assert!(fresh);
    assert_eq!(fix.latitude, 52.1);
    assert_eq!(fix.longitude, 13.2);
    assert_eq!(fix.elevation, 10.0);
    assert_eq!(fix.facing, 90.0);
    assert_eq!(fix.timestamp_ms, 100);
}

#[tokio::test]
async fn stale_update_does_not_regress_cache() {
    let (mut machine, script, cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;
    run_pairing(&mut machine, &script).await;

    script.push(location(52.1, 100));
    machine.tick().await;

    // An older fix arrives late; the cache must keep the newer one.
    script.push(location(48.0, 50));
    machine.tick().await;

    let (fix, fresh) = cache.read();
    assert!(fresh);
    assert_eq!(fix.latitude, 52.1);
    assert_eq!(fix.timestamp_ms, 100);
}

#[tokio::test]
async fn queries_return_each_fix_between_updates() {
    let (mut machine, script, cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;
    run_pairing(&mut machine, &script).await;

    for step in 1..=5u64 {
        script.push(location(50.0 + step as f64, step * 100));
        machine.tick().await;

        let (fix, fresh) = cache.read();
        assert!(fresh);
        assert_eq!(fix.latitude, 50.0 + step as f64);
        assert_eq!(fix.timestamp_ms, step * 100);
    }
}

#[tokio::test]
async fn dial_failures_retry_with_configured_wait() {
    let config = test_config();
    let retry_wait = config.retry_wait;
    let (mut machine, script, _cache) = machine(config);

    script.fail_next_connects(3);

    for _ in 0..3 {
        let wait = machine.tick().await;
        assert_eq!(machine.state(), SessionState::ConnectPrimary);
        assert_eq!(wait, retry_wait);
    }

    // Fourth attempt succeeds and moves on.
    let wait = machine.tick().await;
    assert_eq!(machine.state(), SessionState::AuthRequestPrimary);
    assert_eq!(wait, TICK_WAIT);
    assert_eq!(script.dials().len(), 4);
}

#[tokio::test]
async fn auth_rejection_restarts_at_dial() {
    let (mut machine, script, _cache) = machine(test_config());

    machine.tick().await;
    machine.tick().await;
    assert_eq!(machine.state(), SessionState::AuthChallengePrimary);

    // Outright rejection before any challenge.
    script.push(NetMessage::AuthResult {
        result: RESULT_DENIED,
    });
    machine.tick().await;

    assert_eq!(machine.state(), SessionState::ConnectPrimary);
}

#[tokio::test]
async fn channel_mismatch_restarts_at_dial() {
    let (mut machine, script, _cache) = machine(test_config());

    machine.tick().await;
    run_auth_exchange(&mut machine, &script, HashKind::Blake3).await;
    machine.tick().await;
    assert_eq!(machine.state(), SessionState::ChannelResponse);

    script.push(NetMessage::ChannelResponse {
        channel: "some.other.channel".to_string(),
        address: "10.9.9.9".to_string(),
        port: 1,
    });
    machine.tick().await;

    assert_eq!(machine.state(), SessionState::ConnectPrimary);
}

#[tokio::test]
async fn bad_pair_proof_denies_and_allows_retry() {
    let (mut machine, script, _cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;

    script.push(NetMessage::PairRequest { role: 1 });
    machine.tick().await;

    let first_nonce = match script.last_sent() {
        NetMessage::PairChallenge { nonce, .. } => nonce,
        other => panic!("expected pair challenge, got {:?}", other),
    };

    // Proof with the right nonce but the wrong device key.
    let proof = encrypt_nonce(first_nonce, &derive_session_key(DEVICE_PASSWORD)).unwrap();
    script.push(NetMessage::PairProof {
        device_key: "device-9999".to_string(),
        proof,
    });
    machine.tick().await;

    assert_eq!(
        script.last_sent(),
        NetMessage::PairResult {
            result: RESULT_DENIED
        }
    );
    assert_eq!(machine.state(), SessionState::AwaitPairing);
    assert!(!machine.is_paired());

    // A new pairing attempt still works, with a fresh nonce.
    let second_nonce = run_pairing(&mut machine, &script).await;
    assert_ne!(first_nonce, second_nonce);
}

#[tokio::test]
async fn foreign_nonce_proof_is_denied() {
    let (mut machine, script, _cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;

    script.push(NetMessage::PairRequest { role: 1 });
    machine.tick().await;

    // Correct key, wrong nonce: a replayed proof.
    let proof = encrypt_nonce(0x1234_5678, &derive_session_key(DEVICE_PASSWORD)).unwrap();
    script.push(NetMessage::PairProof {
        device_key: DEVICE_KEY.to_string(),
        proof,
    });
    machine.tick().await;

    assert_eq!(
        script.last_sent(),
        NetMessage::PairResult {
            result: RESULT_DENIED
        }
    );
    assert_eq!(machine.state(), SessionState::AwaitPairing);
}

#[tokio::test]
async fn pairing_nonces_are_unique_across_attempts() {
    let (mut machine, script, _cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;

    let mut nonces = Vec::new();
    for _ in 0..8 {
        script.push(NetMessage::PairRequest { role: 1 });
        machine.tick().await;

        match script.last_sent() {
            NetMessage::PairChallenge { nonce, .. } => nonces.push(nonce),
            other => panic!("expected pair challenge, got {:?}", other),
        }

        // Abandon the attempt so the next request is accepted again.
        script.push(NetMessage::PairProof {
            device_key: DEVICE_KEY.to_string(),
            proof: vec![0; 16],
        });
        machine.tick().await;
        assert_eq!(machine.state(), SessionState::AwaitPairing);
    }

    let mut deduplicated = nonces.clone();
    deduplicated.sort_unstable();
    deduplicated.dedup();
    assert_eq!(deduplicated.len(), nonces.len());
}

#[tokio::test]
async fn partner_closed_returns_to_pairing_wait() {
    let (mut machine, script, cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;
    run_pairing(&mut machine, &script).await;

    script.push(location(52.1, 100));
    script.push(NetMessage::PartnerClosed);
    machine.tick().await;

    assert_eq!(machine.state(), SessionState::AwaitPairing);
    assert!(!machine.is_paired());

    // The last fix outlives the partner; only freshness semantics
    // change nothing here.
    let (fix, fresh) = cache.read();
    assert!(fresh);
    assert_eq!(fix.latitude, 52.1);
}

#[tokio::test]
async fn connection_loss_resets_to_dial_state() {
    let (mut machine, script, _cache) = machine(test_config());
    run_to_await_pairing(&mut machine, &script).await;
    run_pairing(&mut machine, &script).await;

    script.drop_connection();
    // Keep the redial failing so the machine stays observable at the
    // dial state.
    script.fail_next_connects(1);
    machine.tick().await;

    assert_eq!(machine.state(), SessionState::ConnectPrimary);
    assert!(!machine.is_paired());
}

#[tokio::test]
async fn unexpected_messages_are_ignored() {
    let (mut machine, script, _cache) = machine(test_config());

    machine.tick().await;
    machine.tick().await;
    assert_eq!(machine.state(), SessionState::AuthChallengePrimary);

    // Messages from entirely different protocol phases.
    script.push(NetMessage::PairRequest { role: 1 });
    script.push(location(1.0, 1));
    machine.tick().await;

    assert_eq!(machine.state(), SessionState::AuthChallengePrimary);
    assert_eq!(script.sent().len(), 1); // only the auth request
}

/**
 *  Broker
 */

#[derive(Default)]
struct CollectSink {
    responses: Mutex<Vec<LocationResponse>>,
}

impl EventSink for CollectSink {
    fn submit(&self, response: LocationResponse) -> Result<()> {
        self.responses.lock().unwrap().push(response);
        Ok(())
    }
}

#[tokio::test]
async fn queries_never_block_on_the_session() {
    let script = ScriptChannel::new();
    script.fail_next_connects(1000);

    let sink = Arc::new(CollectSink::default());
    let broker = LocationBroker::spawn(test_config(), script, sink.clone());

    // The session is stuck in dial retries the whole time; queries
    // must still complete immediately.
    let start = std::time::Instant::now();
    for group in 0..100 {
        broker.handle_get_location(group);
    }
    assert!(start.elapsed() < Duration::from_secs(5));

    {
        let responses = sink.responses.lock().unwrap();
        assert_eq!(responses.len(), 100);
        assert!(responses.iter().all(|r| !r.success));
        assert_eq!(responses[99].group_id, 99);
    }

    broker.shutdown().await;
}
