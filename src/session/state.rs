/**
 * session/state.rs
 *
 * Connection states and the transition functions driving them. The
 * enum is closed and both functions are total: there is no "unknown
 * state" to fall into.
 */

/// Session state, one per scheduling tick.
///
/// The full two-server walk: dial and authenticate against the
/// connection server, resolve the communication channel, dial and
/// authenticate against the communication server, pair with an app
/// client, then stream location updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing the connection server.
    ConnectPrimary,
    /// Sending the auth request to the connection server.
    AuthRequestPrimary,
    /// Waiting for the connection server's password challenge.
    AuthChallengePrimary,
    /// Proof sent, waiting for the auth result.
    AuthResultPrimary,
    /// Requesting the communication channel endpoint by name.
    ChannelRequest,
    /// Waiting for the resolved endpoint.
    ChannelResponse,
    /// Dialing the communication server.
    ConnectSecondary,
    /// Sending the auth request to the communication server.
    AuthRequestSecondary,
    /// Waiting for the communication server's password challenge.
    AuthChallengeSecondary,
    /// Proof sent, waiting for the auth result.
    AuthResultSecondary,
    /// Authenticated, waiting for an app client pairing request.
    AwaitPairing,
    /// Pairing challenge issued, waiting for the proof.
    PairProofWait,
    /// Paired, receiving location updates.
    Streaming,
}

impl SessionState {
    /// Every member, for exhaustive property checks.
    pub const ALL: [SessionState; 13] = [
        SessionState::ConnectPrimary,
        SessionState::AuthRequestPrimary,
        SessionState::AuthChallengePrimary,
        SessionState::AuthResultPrimary,
        SessionState::ChannelRequest,
        SessionState::ChannelResponse,
        SessionState::ConnectSecondary,
        SessionState::AuthRequestSecondary,
        SessionState::AuthChallengeSecondary,
        SessionState::AuthResultSecondary,
        SessionState::AwaitPairing,
        SessionState::PairProofWait,
        SessionState::Streaming,
    ];

    /// Next state after the current state's action succeeded.
    pub fn advance(self) -> SessionState {
        match self {
            SessionState::ConnectPrimary => SessionState::AuthRequestPrimary,
            SessionState::AuthRequestPrimary => SessionState::AuthChallengePrimary,
            SessionState::AuthChallengePrimary => SessionState::AuthResultPrimary,
            SessionState::AuthResultPrimary => SessionState::ChannelRequest,
            SessionState::ChannelRequest => SessionState::ChannelResponse,
            SessionState::ChannelResponse => SessionState::ConnectSecondary,
            SessionState::ConnectSecondary => SessionState::AuthRequestSecondary,
            SessionState::AuthRequestSecondary => SessionState::AuthChallengeSecondary,
            SessionState::AuthChallengeSecondary => SessionState::AuthResultSecondary,
            SessionState::AuthResultSecondary => SessionState::AwaitPairing,
            SessionState::AwaitPairing => SessionState::PairProofWait,
            SessionState::PairProofWait => SessionState::Streaming,
            SessionState::Streaming => SessionState::Streaming,
        }
    }

    /// Restart state after the current state's action failed.
    ///
    /// Pairing-phase failures keep the authenticated session and fall
    /// back to waiting for a new pairing request; everything else
    /// re-dials from the top. Auth rejections and network failures
    /// deliberately share this path.
    pub fn restart(self) -> SessionState {
        match self {
            SessionState::AwaitPairing
            | SessionState::PairProofWait
            | SessionState::Streaming => SessionState::AwaitPairing,
            _ => SessionState::ConnectPrimary,
        }
    }

    /// Whether this state is actively dialing; the per-tick liveness
    /// check skips these, everything else resets on a dead channel.
    pub fn is_dialing(self) -> bool {
        matches!(
            self,
            SessionState::ConnectPrimary | SessionState::ConnectSecondary
        )
    }
}
