use prost::bytes::Bytes;

/// Frame sent from client to server.
///
/// Exactly one variant is set; the constructors below are the only way the
/// rest of the workspace builds frames.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFrame {
    #[prost(oneof = "client_frame::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<client_frame::Kind>,
}

pub mod client_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Header(super::ClientHeader),
        #[prost(message, tag = "2")]
        Payload(super::Payload),
    }
}

/// Session identity and target, sent once as the first client frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHeader {
    #[prost(string, tag = "1")]
    pub user_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub fqdn: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub port: u32,
}

/// A chunk of relayed bytes. Zero length from the client means EOF.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

/// Frame sent from server to client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
    #[prost(enumeration = "FrameStatus", tag = "1")]
    pub status: i32,
    #[prost(oneof = "server_frame::Kind", tags = "2, 3")]
    pub kind: ::core::option::Option<server_frame::Kind>,
}

pub mod server_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Header(super::ServerHeader),
        #[prost(message, tag = "3")]
        Payload(super::Payload),
    }
}

/// Address the server bound when dialing the target.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHeader {
    #[prost(string, tag = "1")]
    pub addr: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameStatus {
    Session = 0,
    Error = 1,
    Accepted = 2,
    Eof = 3,
}

impl FrameStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            FrameStatus::Session => "SESSION",
            FrameStatus::Error => "ERROR",
            FrameStatus::Accepted => "ACCEPTED",
            FrameStatus::Eof => "EOF",
        }
    }
}

impl ClientFrame {
    pub fn header(user_id: impl Into<String>, fqdn: impl Into<String>, port: u16) -> Self {
        Self {
            kind: Some(client_frame::Kind::Header(ClientHeader {
                user_id: user_id.into(),
                fqdn: fqdn.into(),
                port: u32::from(port),
            })),
        }
    }

    pub fn payload(data: impl Into<Bytes>) -> Self {
        Self {
            kind: Some(client_frame::Kind::Payload(Payload { data: data.into() })),
        }
    }

    /// The zero-length payload that marks the end of the client's stream.
    pub fn eof() -> Self {
        Self::payload(Bytes::new())
    }
}

impl ServerFrame {
    pub fn accepted(addr: impl Into<String>) -> Self {
        Self {
            status: FrameStatus::Accepted as i32,
            kind: Some(server_frame::Kind::Header(ServerHeader { addr: addr.into() })),
        }
    }

    pub fn session(data: impl Into<Bytes>) -> Self {
        Self {
            status: FrameStatus::Session as i32,
            kind: Some(server_frame::Kind::Payload(Payload { data: data.into() })),
        }
    }

    pub fn error() -> Self {
        Self {
            status: FrameStatus::Error as i32,
            kind: None,
        }
    }

    pub fn eof() -> Self {
        Self {
            status: FrameStatus::Eof as i32,
            kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_header_frame_encodes_single_variant() {
        let frame = ClientFrame::header("u1", "example.com", 443);
        let decoded = ClientFrame::decode(frame.encode_to_vec().as_slice()).unwrap();

        match decoded.kind {
            Some(client_frame::Kind::Header(h)) => {
                assert_eq!(h.user_id, "u1");
                assert_eq!(h.fqdn, "example.com");
                assert_eq!(h.port, 443);
            }
            other => panic!("Expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_eof_payload_is_empty() {
        match ClientFrame::eof().kind {
            Some(client_frame::Kind::Payload(p)) => assert!(p.data.is_empty()),
            other => panic!("Expected payload, got {:?}", other),
        }
    }

    #[test]
    fn test_server_status_survives_decode() {
        let frame = ServerFrame::accepted("10.0.0.1:5555");
        let decoded = ServerFrame::decode(frame.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.status(), FrameStatus::Accepted);

        // Status-only frames carry no body.
        let decoded = ServerFrame::decode(ServerFrame::eof().encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.status(), FrameStatus::Eof);
        assert!(decoded.kind.is_none());
    }
}
