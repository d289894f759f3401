use crate::error::CoreError;
use crate::time::unix_seconds;
use blake3::Hasher;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const STATUS_BROADCAST_USER: &str = "status";

/// Addressing domain of an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Server {
    User,
    LegacyUser,
    Group,
    Broadcast,
    Newsletter,
    Lid,
}

impl Server {
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::User => "s.whatsapp.net",
            Server::LegacyUser => "c.us",
            Server::Group => "g.us",
            Server::Broadcast => "broadcast",
            Server::Newsletter => "newsletter",
            Server::Lid => "lid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "s.whatsapp.net" => Some(Server::User),
            "c.us" => Some(Server::LegacyUser),
            "g.us" => Some(Server::Group),
            "broadcast" => Some(Server::Broadcast),
            "newsletter" => Some(Server::Newsletter),
            "lid" => Some(Server::Lid),
            _ => None,
        }
    }
}

/// `user[:device]@server`. Device 0 is the primary device and is never
/// written out.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: Server,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server,
        }
    }

    pub fn with_device(user: impl Into<String>, device: u16, server: Server) -> Self {
        Self {
            user: user.into(),
            device,
            server,
        }
    }

    pub fn status_broadcast() -> Self {
        Self::new(STATUS_BROADCAST_USER, Server::Broadcast)
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let malformed = || CoreError::MalformedIdentity(value.to_string());
        let (user_part, server_part) = value.split_once('@').ok_or_else(malformed)?;
        let server = Server::parse(server_part).ok_or_else(malformed)?;
        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => (user, device.parse::<u16>().map_err(|_| malformed())?),
            None => (user_part, 0),
        };
        if user.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            user: user.to_string(),
            device,
            server,
        })
    }

    /// Canonical form used for every cache lookup and comparison: primary
    /// device, legacy user domain folded into the user domain.
    pub fn normalized(&self) -> Jid {
        let server = match self.server {
            Server::LegacyUser => Server::User,
            other => other,
        };
        Jid::new(self.user.clone(), server)
    }

    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == Server::Broadcast && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    pub fn is_lid(&self) -> bool {
        self.server == Server::Lid
    }

    pub fn is_user(&self) -> bool {
        matches!(self.server, Server::User | Server::LegacyUser)
    }

    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server.as_str())
        } else {
            write!(f, "{}@{}", self.user, self.server.as_str())
        }
    }
}

impl FromStr for Jid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

/// A physical device of a user as returned by directory resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub user: String,
    pub device: u16,
}

impl Device {
    pub fn new(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }

    pub fn jid(&self, server: Server) -> Jid {
        Jid::with_device(self.user.clone(), self.device, server)
    }
}

/// Identity of a message as seen from this account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote: Jid,
    pub id: String,
    pub from_me: bool,
    pub participant: Option<Jid>,
}

pub fn generate_message_id(own: Option<&Jid>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(&unix_seconds().to_be_bytes());
    if let Some(own) = own {
        hasher.update(own.user.as_bytes());
        hasher.update(b"@c.us");
    }
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    hasher.update(&random);
    let digest = hasher.finalize();
    format!("3EB0{}", hex::encode_upper(&digest.as_bytes()[..9]))
}
