use std::{fmt, net::SocketAddr, str::FromStr};

use rand::RngCore;

use crate::{
    hex::{decode_hex, HexDisplayExt},
    Error, Result,
};

/// Longest contact address a peer may send, in bytes.
pub const MAX_ADDRESS_LEN: usize = 256;

pub const TOKEN_LEN: usize = 16;

/// The per-tick order the manager broadcasts to every worker. Values match
/// the int32 encoding on the wire.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Stop = 0,
    Continue = 1,
    Snapshot = 2,
}

impl TryFrom<i32> for Directive {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Directive::Stop),
            1 => Ok(Directive::Continue),
            2 => Ok(Directive::Snapshot),
            other => Err(Error::protocol(format!(
                "directive {other} is not STOP, CONTINUE or SNAPSHOT"
            ))),
        }
    }
}

impl From<Directive> for i32 {
    fn from(directive: Directive) -> Self {
        directive as i32
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Stop => write!(f, "STOP"),
            Directive::Continue => write!(f, "CONTINUE"),
            Directive::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

/// Identifies one session between the broker and the cohort it spawned.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(pub [u8; TOKEN_LEN]);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hex())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.0.hex())
    }
}

impl FromStr for SessionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex(s)
            .map(SessionToken)
            .ok_or_else(|| Error::config(format!("`{s}` is not a {TOKEN_LEN}-byte hex token")))
    }
}

/// Tag byte that opens every link. The connecting side writes it so the
/// accepting side knows who is calling.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloType {
    /// A client asking the broker for a cohort
    RequestCohort = 1,
    /// A freshly spawned cohort member checking in with the broker
    Member = 2,
    /// A client attaching to its manager
    Session = 3,
    /// A worker attaching to its manager
    Worker = 4,
    /// A worker attaching to its successor in the ring
    Halo = 5,
}

impl TryFrom<u8> for HelloType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(HelloType::RequestCohort),
            2 => Ok(HelloType::Member),
            3 => Ok(HelloType::Session),
            4 => Ok(HelloType::Worker),
            5 => Ok(HelloType::Halo),
            other => Err(Error::protocol(format!("unknown hello tag {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hello {
    RequestCohort,
    /// Rank 0 includes the address its client should connect to.
    Member {
        token: SessionToken,
        rank: u32,
        contact: Option<SocketAddr>,
    },
    Session,
    Worker {
        rank: u32,
        halo: SocketAddr,
    },
    Halo {
        rank: u32,
    },
}

impl Hello {
    pub fn hello_type(&self) -> HelloType {
        match self {
            Hello::RequestCohort => HelloType::RequestCohort,
            Hello::Member { .. } => HelloType::Member,
            Hello::Session => HelloType::Session,
            Hello::Worker { .. } => HelloType::Worker,
            Hello::Halo { .. } => HelloType::Halo,
        }
    }
}

pub fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| Error::protocol(format!("`{s}` is not a socket address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_values_match_the_wire() {
        for directive in [Directive::Stop, Directive::Continue, Directive::Snapshot] {
            let value = i32::from(directive);
            assert_eq!(Directive::try_from(value).unwrap(), directive);
        }
        assert_eq!(i32::from(Directive::Stop), 0);
        assert_eq!(i32::from(Directive::Snapshot), 2);
    }

    #[test]
    fn unknown_directive_is_a_protocol_error() {
        let err = Directive::try_from(3).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[test]
    fn unknown_hello_tag_is_rejected() {
        assert!(HelloType::try_from(0).is_err());
        assert!(HelloType::try_from(6).is_err());
        assert_eq!(HelloType::try_from(5).unwrap(), HelloType::Halo);
    }

    #[test]
    fn tokens_parse_from_their_display() {
        let token = SessionToken::generate();
        let parsed: SessionToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
        assert!("not-a-token".parse::<SessionToken>().is_err());
    }
}
