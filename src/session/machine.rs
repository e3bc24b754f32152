/**
 * session/machine.rs
 *
 * The server session loop: keeps one authenticated, paired session
 * alive against the location servers and feeds received fixes into
 * the shared cache. One state action per tick; failures never leave
 * this module, they drive transitions and log lines.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::state::SessionState;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::location::{LocationCache, LocationFix};
use crate::protocol::{
    self, ClientRole, HashKind, NetMessage, SessionKey, PROTOCOL_VERSION, RESULT_DENIED,
    RESULT_OK,
};

/// Wait between ticks while handshaking.
pub const TICK_WAIT: Duration = Duration::from_millis(250);

/// Session state machine
///
/// Owns the channel and the handshake/pairing bookkeeping; shares the
/// location cache with the query path. Runs on one background task
/// for the broker's entire lifetime.
pub struct SessionMachine<C: Channel> {
    config: Arc<ServerConfig>,
    channel: C,
    cache: Arc<LocationCache>,

    state: SessionState,

    /// Key derived from the device password; decrypts app client
    /// frames and pairing proofs.
    device_session_key: SessionKey,

    /// Communication server endpoint from channel discovery.
    secondary: Option<(String, u16)>,

    /// Nonce issued with the last pairing challenge.
    pair_nonce: u32,

    paired: bool,
}

impl<C: Channel> SessionMachine<C> {
    pub fn new(config: Arc<ServerConfig>, channel: C, cache: Arc<LocationCache>) -> Self {
        let device_session_key = protocol::derive_session_key(&config.device_password);

        Self {
            config,
            channel,
            cache,
            state: SessionState::ConnectPrimary,
            device_session_key,
            secondary: None,
            pair_nonce: 0,
            paired: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Run until the owner clears the run flag. The flag is checked at
    /// the top of every tick; waits are cut short through the notify
    /// handle so shutdown never blocks on a retry wait.
    pub async fn run(mut self, run: Arc<AtomicBool>, stop: Arc<Notify>) {
        info!("Location server session started");

        while run.load(Ordering::SeqCst) {
            let wait = self.tick().await;

            tokio::select! {
                _ = stop.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.channel.disconnect(self.config.timeout).await;
        info!("Location server session stopped");
    }

    /// One scheduling tick: liveness check, then exactly one state
    /// action. Returns the wait before the next tick.
    pub async fn tick(&mut self) -> Duration {
        // A dead channel outside a dial state resets the whole walk.
        if !self.channel.is_connected() && !self.state.is_dialing() {
            info!("Disconnected from server, reconnecting");
            self.drop_session();
            self.enter(SessionState::ConnectPrimary);
        }

        match self.state {
            SessionState::ConnectPrimary => self.connect_primary().await,
            SessionState::AuthRequestPrimary | SessionState::AuthRequestSecondary => {
                self.send_auth_request().await
            }
            SessionState::AuthChallengePrimary | SessionState::AuthChallengeSecondary => {
                self.await_auth_challenge().await
            }
            SessionState::AuthResultPrimary | SessionState::AuthResultSecondary => {
                self.await_auth_result()
            }
            SessionState::ChannelRequest => self.send_channel_request().await,
            SessionState::ChannelResponse => self.await_channel_response(),
            SessionState::ConnectSecondary => self.connect_secondary().await,
            SessionState::AwaitPairing => self.await_pairing().await,
            SessionState::PairProofWait => self.await_pair_proof().await,
            SessionState::Streaming => self.streaming(),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if next != self.state {
            debug!("State {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn drop_session(&mut self) {
        self.paired = false;
        self.secondary = None;
    }

    fn restart(&mut self) {
        self.enter(self.state.restart());
    }

    /// Decryption key for the current state: app client traffic after
    /// secondary auth is encrypted with the device key.
    fn recv_key(&self) -> Option<&SessionKey> {
        match self.state {
            SessionState::AwaitPairing
            | SessionState::PairProofWait
            | SessionState::Streaming => Some(&self.device_session_key),
            _ => None,
        }
    }

    /// Pull the next decodable message, skipping malformed frames.
    fn next_message(&mut self) -> Option<NetMessage> {
        let key = self.recv_key().copied();
        loop {
            match self.channel.recv(key.as_ref()) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => return None,
                Err(e) => {
                    // Malformed frame: state is preserved, the stream
                    // resyncs on the next frame.
                    warn!("Dropped undecodable message: {}", e);
                }
            }
        }
    }

    /**
     *  Connection
     */

    async fn connect_primary(&mut self) -> Duration {
        info!(
            "Connecting to connection server {}:{}",
            self.config.connection_address, self.config.connection_port
        );

        let result = self
            .channel
            .connect(
                &self.config.connection_address,
                self.config.connection_port,
                self.config.timeout,
            )
            .await;

        match result {
            Ok(()) => {
                info!("Connected to connection server");
                self.enter(self.state.advance());
                TICK_WAIT
            }
            Err(e) => {
                warn!("Failed to connect to connection server: {}", e);
                self.config.retry_wait
            }
        }
    }

    async fn connect_secondary(&mut self) -> Duration {
        let (address, port) = match self.secondary.clone() {
            Some(endpoint) => endpoint,
            None => {
                // No discovered endpoint; walk the handshake again.
                warn!("No communication server endpoint, restarting");
                self.enter(SessionState::ConnectPrimary);
                return TICK_WAIT;
            }
        };

        // The connection server is done with us.
        self.channel.disconnect(self.config.timeout).await;

        info!("Connecting to communication server {}:{}", address, port);

        match self
            .channel
            .connect(&address, port, self.config.timeout)
            .await
        {
            Ok(()) => {
                info!("Connected to communication server");
                self.enter(self.state.advance());
                TICK_WAIT
            }
            Err(e) => {
                warn!("Failed to connect to communication server: {}", e);
                self.enter(SessionState::ConnectPrimary);
                self.config.retry_wait
            }
        }
    }

    /**
     *  Server Auth
     */

    async fn send_auth_request(&mut self) -> Duration {
        let request = NetMessage::AuthRequest {
            mail: self.config.account_mail.clone(),
            device_key: self.config.device_key.clone(),
            role: ClientRole::Platform.as_u8(),
            version: PROTOCOL_VERSION,
        };

        match self.channel.send(&request).await {
            Ok(()) => {
                info!("Sent auth request");
                self.enter(self.state.advance());
            }
            Err(e) => {
                warn!("Failed to send auth request: {}", e);
                self.restart();
            }
        }

        TICK_WAIT
    }

    async fn await_auth_challenge(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::AuthChallenge {
                    salt,
                    nonce,
                    hash_kind,
                } => {
                    self.answer_auth_challenge(&salt, nonce, hash_kind).await;
                    break;
                }
                NetMessage::AuthResult { result } if result != RESULT_OK => {
                    // Rejected before the challenge; treated like any
                    // other failure and retried forever.
                    warn!("Authentication denied, result {}", result);
                    self.restart();
                    break;
                }
                other => {
                    debug!("Ignoring {:?} while waiting for challenge", other.opcode());
                }
            }
        }

        TICK_WAIT
    }

    async fn answer_auth_challenge(&mut self, salt: &[u8; protocol::SALT_SIZE], nonce: u32, hash_kind: u8) {
        let kind = match HashKind::from_u8(hash_kind) {
            Ok(kind) => kind,
            Err(e) => {
                // Malformed challenge; keep waiting for a usable one.
                warn!("Unusable auth challenge: {}", e);
                return;
            }
        };

        let key = protocol::password_hash(&self.config.account_password, salt, kind);

        let proof = match protocol::encrypt_nonce(nonce, &key) {
            Ok(proof) => proof,
            Err(e) => {
                warn!("Failed to build auth proof: {}", e);
                self.restart();
                return;
            }
        };

        debug!("Answering auth challenge, proof {}", hex::encode(&proof));

        match self.channel.send(&NetMessage::AuthProof { proof }).await {
            Ok(()) => {
                self.enter(self.state.advance());
            }
            Err(e) => {
                warn!("Failed to send auth proof: {}", e);
                self.restart();
            }
        }
    }

    fn await_auth_result(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::AuthResult { result } => {
                    if result == RESULT_OK {
                        info!("Authenticated with server");
                        self.enter(self.state.advance());
                    } else {
                        warn!("Authentication denied, result {}", result);
                        self.restart();
                    }
                    break;
                }
                other => {
                    debug!("Ignoring {:?} while waiting for auth result", other.opcode());
                }
            }
        }

        TICK_WAIT
    }

    /**
     *  Channel Discovery
     */

    async fn send_channel_request(&mut self) -> Duration {
        let request = NetMessage::ChannelRequest {
            channel: self.config.channel.clone(),
        };

        match self.channel.send(&request).await {
            Ok(()) => {
                info!("Sent channel request for {:?}", self.config.channel);
                self.enter(self.state.advance());
            }
            Err(e) => {
                warn!("Failed to send channel request: {}", e);
                self.restart();
            }
        }

        TICK_WAIT
    }

    fn await_channel_response(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::ChannelResponse {
                    channel,
                    address,
                    port,
                } => {
                    if channel != self.config.channel {
                        warn!("Channel response for unexpected channel {:?}", channel);
                        self.restart();
                    } else {
                        info!("Communication server resolved: {}:{}", address, port);
                        self.secondary = Some((address, port));
                        self.enter(self.state.advance());
                    }
                    break;
                }
                other => {
                    debug!(
                        "Ignoring {:?} while waiting for channel response",
                        other.opcode()
                    );
                }
            }
        }

        TICK_WAIT
    }

    /**
     *  Device Pairing
     */

    async fn await_pairing(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::PairRequest { .. } => {
                    // Fresh nonce per attempt, proofs cannot be
                    // replayed across challenges.
                    self.pair_nonce = rand::random::<u32>();

                    let challenge = NetMessage::PairChallenge {
                        role: ClientRole::Platform.as_u8(),
                        nonce: self.pair_nonce,
                    };

                    match self.channel.send(&challenge).await {
                        Ok(()) => {
                            info!("Sent pairing challenge");
                            self.enter(self.state.advance());
                        }
                        Err(e) => {
                            warn!("Failed to send pairing challenge: {}", e);
                            self.restart();
                        }
                    }
                    break;
                }
                other => {
                    debug!("Ignoring {:?} while waiting for pairing", other.opcode());
                }
            }
        }

        TICK_WAIT
    }

    async fn await_pair_proof(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::PairProof { device_key, proof } => {
                    let result = self.check_pair_proof(&device_key, &proof);

                    let sent = self
                        .channel
                        .send(&NetMessage::PairResult { result })
                        .await;

                    match sent {
                        Ok(()) if result == RESULT_OK => {
                            info!("App client paired");
                            self.paired = true;
                            self.enter(self.state.advance());
                        }
                        Ok(()) => {
                            self.restart();
                        }
                        Err(e) => {
                            warn!("Failed to send pair result: {}", e);
                            self.restart();
                        }
                    }
                    break;
                }
                other => {
                    debug!("Ignoring {:?} while waiting for pair proof", other.opcode());
                }
            }
        }

        TICK_WAIT
    }

    fn check_pair_proof(&self, device_key: &str, proof: &[u8]) -> u8 {
        match protocol::decrypt_nonce(proof, &self.device_session_key) {
            Ok(nonce) if nonce == self.pair_nonce => {}
            Ok(_) => {
                warn!("Pair proof has invalid nonce");
                return RESULT_DENIED;
            }
            Err(e) => {
                warn!("Pair proof undecryptable: {}", e);
                return RESULT_DENIED;
            }
        }

        if device_key != self.config.device_key {
            warn!("Pair proof has invalid device key");
            return RESULT_DENIED;
        }

        RESULT_OK
    }

    /**
     *  Location Streaming
     */

    fn streaming(&mut self) -> Duration {
        while let Some(message) = self.next_message() {
            match message {
                NetMessage::LocationUpdate {
                    latitude,
                    longitude,
                    elevation,
                    facing,
                    timestamp_ms,
                } => {
                    let applied = self.cache.write(LocationFix {
                        latitude,
                        longitude,
                        elevation,
                        facing,
                        timestamp_ms,
                    });

                    if applied {
                        debug!("Location fix applied, t={}", timestamp_ms);
                    } else {
                        debug!("Stale location fix dropped, t={}", timestamp_ms);
                    }
                }
                NetMessage::PartnerClosed => {
                    info!("App client disconnected, waiting for reconnect");
                    self.paired = false;
                    self.restart();
                    break;
                }
                other => {
                    debug!("Ignoring {:?} while streaming", other.opcode());
                }
            }
        }

        self.config.update_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use async_trait::async_trait;

    /// Channel that refuses every operation.
    struct DeadChannel;

    #[async_trait]
    impl Channel for DeadChannel {
        async fn connect(
            &mut self,
            _address: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<(), ChannelError> {
            Err(ChannelError::ConnectFailed("refused".to_string()))
        }

        async fn disconnect(&mut self, _timeout: Duration) {}

        fn is_connected(&self) -> bool {
            false
        }

        async fn send(&mut self, _message: &NetMessage) -> Result<(), ChannelError> {
            Err(ChannelError::NotConnected)
        }

        fn recv(
            &mut self,
            _key: Option<&SessionKey>,
        ) -> Result<Option<NetMessage>, ChannelError> {
            Ok(None)
        }
    }

    fn machine() -> SessionMachine<DeadChannel> {
        let config = Arc::new(ServerConfig {
            retry_wait: Duration::from_secs(7),
            ..ServerConfig::default()
        });
        SessionMachine::new(config, DeadChannel, Arc::new(LocationCache::new()))
    }

    #[test]
    fn failed_dial_stays_and_waits_retry() {
        tokio_test::block_on(async {
            let mut machine = machine();

            let wait = machine.tick().await;

            assert_eq!(machine.state(), SessionState::ConnectPrimary);
            assert_eq!(wait, Duration::from_secs(7));
        });
    }

    #[test]
    fn dead_channel_resets_any_state() {
        tokio_test::block_on(async {
            let mut machine = machine();
            machine.state = SessionState::Streaming;
            machine.paired = true;

            machine.tick().await;

            assert_eq!(machine.state(), SessionState::ConnectPrimary);
            assert!(!machine.is_paired());
        });
    }
}
