// Connection lifecycle, linear with Disconnected absorbing every state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Dialing,
    Handshaking,
    Active,
    Disconnected,
}

// Per-connection state. Both sides start choked and uninterested.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    // Bytes of block data accepted over this connection.
    pub downloaded: u64,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            downloaded: 0,
        }
    }
}
