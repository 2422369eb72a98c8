//! Connection states

use std::fmt;

/// Protocol state of an RxP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not yet listening or connecting
    Open,
    /// Waiting for YO segments
    Listen,
    /// YO sent, waiting for the peer's YO
    YoSent,
    /// Listener holding half-open handshakes
    YoRcvd,
    /// YO+ACK sent, waiting for the final ACK
    SynYoAckSent,
    Established,
    /// Own CYA sent, not yet acknowledged
    CyaSent,
    /// Own CYA acknowledged, waiting for the peer's CYA
    CyaWait,
    /// Both sides closed, lingering to re-acknowledge a lost final ACK
    LastWait,
    /// Peer closed, local side may still send
    CloseWait,
    /// Own CYA sent after the peer closed
    LastWord,
    Closed,
}

impl ConnectionState {
    /// True if application data may be queued for sending
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::CloseWait)
    }

    /// True if the peer may still deliver new data
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::CyaSent | ConnectionState::CyaWait
        )
    }

    /// True while the opening handshake is in progress
    pub fn is_handshaking(self) -> bool {
        matches!(self, ConnectionState::YoSent | ConnectionState::SynYoAckSent)
    }

    /// True once a close has begun on either side
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::CyaSent
                | ConnectionState::CyaWait
                | ConnectionState::LastWait
                | ConnectionState::CloseWait
                | ConnectionState::LastWord
        )
    }

    /// True if the state is a listening socket
    pub fn is_listening(self) -> bool {
        matches!(self, ConnectionState::Listen | ConnectionState::YoRcvd)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Open => "OPEN",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::YoSent => "YO_SENT",
            ConnectionState::YoRcvd => "YO_RCVD",
            ConnectionState::SynYoAckSent => "SYN_YO_ACK_SENT",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::CyaSent => "CYA_SENT",
            ConnectionState::CyaWait => "CYA_WAIT",
            ConnectionState::LastWait => "LAST_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastWord => "LAST_WORD",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
