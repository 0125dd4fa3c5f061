//! Cluster configuration: an ordered list of servers and their roles.
//!
//! Unlike the two unordered `HashSet`s (`members`/`learners`) used by an
//! earlier, simpler design, callers here need a stable, order-preserving
//! view (`voting_index` depends on it), so membership is kept as a single
//! ordered vector and role is just a field on each entry.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::{RaftError, Result};
use crate::types::{ServerId, ServerRole};

const ENCODING_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub id: ServerId,
    pub address: String,
    pub role: ServerRole,
}

/// The ordered set of servers participating in a cluster.
///
/// Order is preserved across `add`; `remove` compacts the vector (no holes),
/// so indices returned by `index`/`voting_index` are only stable until the
/// next mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    servers: Vec<ServerDescriptor>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter()
    }

    pub fn get(&self, id: ServerId) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Appends a new server. Preserves insertion order.
    pub fn add(&mut self, id: ServerId, address: impl Into<String>, role: ServerRole) -> Result<()> {
        if id == 0 {
            return Err(RaftError::BadServerId);
        }
        let address = address.into();
        if address.is_empty() {
            return Err(RaftError::NoServerAddress);
        }
        if self.servers.iter().any(|s| s.id == id) {
            return Err(RaftError::DupServerId(id));
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(RaftError::DupServerAddress(address));
        }
        self.servers.push(ServerDescriptor { id, address, role });
        Ok(())
    }

    /// Removes a server, compacting the vector so no gaps remain.
    pub fn remove(&mut self, id: ServerId) -> Result<()> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or(RaftError::UnknownServerId(id))?;
        self.servers.remove(pos);
        Ok(())
    }

    /// Number of servers with the `Voter` role.
    pub fn n_voting(&self) -> usize {
        self.servers.iter().filter(|s| s.role.is_voter()).count()
    }

    /// Position of `id` in the full ordered list, or `len()` if absent.
    pub fn index(&self, id: ServerId) -> usize {
        self.servers
            .iter()
            .position(|s| s.id == id)
            .unwrap_or(self.servers.len())
    }

    /// Position of `id` among voters only, or the total voter count if `id`
    /// is absent or is not a voter.
    pub fn voting_index(&self, id: ServerId) -> usize {
        let mut voting_seen = 0usize;
        for s in &self.servers {
            if s.id == id {
                return if s.role.is_voter() { voting_seen } else { self.n_voting() };
            }
            if s.role.is_voter() {
                voting_seen += 1;
            }
        }
        self.n_voting()
    }

    pub fn voters(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| s.role.is_voter())
    }

    pub fn copy(&self) -> Configuration {
        self.clone()
    }

    /// `[u8 version][u64 n-servers]{u64 id, nul-terminated address, u8 role}*n`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u8(ENCODING_VERSION).unwrap();
        out.write_u64::<LE>(self.servers.len() as u64).unwrap();
        for s in &self.servers {
            out.write_u64::<LE>(s.id).unwrap();
            out.extend_from_slice(s.address.as_bytes());
            out.push(0);
            out.write_u8(role_to_byte(s.role)).unwrap();
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Configuration> {
        let mut cur = Cursor::new(bytes);
        let version = cur
            .read_u8()
            .map_err(|_| RaftError::Corrupt("configuration: truncated version".into()))?;
        if version != ENCODING_VERSION {
            return Err(RaftError::Corrupt(format!(
                "configuration: unsupported encoding version {version}"
            )));
        }
        let n = cur
            .read_u64::<LE>()
            .map_err(|_| RaftError::Corrupt("configuration: truncated server count".into()))?;

        let mut servers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = cur
                .read_u64::<LE>()
                .map_err(|_| RaftError::Corrupt("configuration: truncated id".into()))?;

            let mut address_bytes = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                cur.read_exact(&mut byte)
                    .map_err(|_| RaftError::Corrupt("configuration: unterminated address".into()))?;
                if byte[0] == 0 {
                    break;
                }
                address_bytes.push(byte[0]);
            }
            let address = String::from_utf8(address_bytes)
                .map_err(|_| RaftError::Corrupt("configuration: address is not utf8".into()))?;

            let role_byte = cur
                .read_u8()
                .map_err(|_| RaftError::Corrupt("configuration: truncated role".into()))?;
            let role = role_from_byte(role_byte)?;

            servers.push(ServerDescriptor { id, address, role });
        }

        Ok(Configuration { servers })
    }
}

fn role_to_byte(role: ServerRole) -> u8 {
    match role {
        ServerRole::Voter => 0,
        ServerRole::StandBy => 1,
        ServerRole::Spare => 2,
    }
}

fn role_from_byte(b: u8) -> Result<ServerRole> {
    match b {
        0 => Ok(ServerRole::Voter),
        1 => Ok(ServerRole::StandBy),
        2 => Ok(ServerRole::Spare),
        other => Err(RaftError::Corrupt(format!("configuration: unknown role byte {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_remove_preserves_order() {
        let mut c = Configuration::new();
        c.add(1, "127.0.0.1:666", ServerRole::Voter).unwrap();
        assert_eq!(c.len(), 1);

        c.add(2, "192.168.1.1:666", ServerRole::StandBy).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);

        c.remove(1).unwrap();
        let remaining: Vec<_> = c.iter().cloned().collect();
        assert_eq!(
            remaining,
            vec![ServerDescriptor {
                id: 2,
                address: "192.168.1.1:666".into(),
                role: ServerRole::StandBy
            }]
        );
    }

    #[test]
    fn duplicate_rejection() {
        let mut c = Configuration::new();
        c.add(1, "127.0.0.1:666", ServerRole::Voter).unwrap();

        assert!(matches!(
            c.add(1, "192.168.1.1:666", ServerRole::Voter),
            Err(RaftError::DupServerId(1))
        ));
        assert!(matches!(
            c.add(2, "127.0.0.1:666", ServerRole::Voter),
            Err(RaftError::DupServerAddress(_))
        ));
    }

    #[test]
    fn voting_index() {
        let mut c = Configuration::new();
        c.add(1, "a", ServerRole::StandBy).unwrap();
        c.add(2, "b", ServerRole::Voter).unwrap();
        c.add(3, "c", ServerRole::Voter).unwrap();

        assert_eq!(c.voting_index(3), 1);
        // id 1 is present but not a voter -> signals "absent from voters" via n_voting()
        assert_eq!(c.voting_index(1), c.n_voting());
        assert_eq!(c.voting_index(1), 2);
    }

    #[test]
    fn bad_server_id_and_address() {
        let mut c = Configuration::new();
        assert!(matches!(c.add(0, "x", ServerRole::Voter), Err(RaftError::BadServerId)));
        assert!(matches!(c.add(1, "", ServerRole::Voter), Err(RaftError::NoServerAddress)));
    }

    #[test]
    fn unknown_server_on_remove() {
        let mut c = Configuration::new();
        assert!(matches!(c.remove(42), Err(RaftError::UnknownServerId(42))));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut c = Configuration::new();
        c.add(1, "10.0.0.1:9000", ServerRole::Voter).unwrap();
        c.add(2, "10.0.0.2:9000", ServerRole::Voter).unwrap();
        c.add(3, "10.0.0.3:9000", ServerRole::StandBy).unwrap();

        let bytes = c.encode();
        let decoded = Configuration::decode(&bytes).unwrap();
        assert_eq!(c, decoded);
    }

    #[test]
    fn decode_rejects_bad_version() {
        let err = Configuration::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, RaftError::Corrupt(_)));
    }

    fn arb_role() -> impl proptest::strategy::Strategy<Value = ServerRole> {
        proptest::prop_oneof![
            proptest::strategy::Just(ServerRole::Voter),
            proptest::strategy::Just(ServerRole::StandBy),
            proptest::strategy::Just(ServerRole::Spare),
        ]
    }

    /// Builds a `Configuration` from ids/addresses/roles that are already
    /// unique by construction, so `add` never rejects one.
    fn arb_configuration() -> impl proptest::strategy::Strategy<Value = Configuration> {
        proptest::collection::vec((1u64..1000, arb_role()), 0..8).prop_map(|entries| {
            let mut c = Configuration::new();
            for (i, (id, role)) in entries.into_iter().enumerate() {
                // id is taken from the shuffled range above but index folded in
                // to guarantee address uniqueness even if two ids collide.
                let address = format!("10.0.{}.{}:9000", i, id % 256);
                let _ = c.add(id.wrapping_add(i as u64 * 1000 + 1), address, role);
            }
            c
        })
    }

    proptest::proptest! {
        #[test]
        fn encode_decode_roundtrip_arbitrary(c in arb_configuration()) {
            let decoded = Configuration::decode(&c.encode()).unwrap();
            proptest::prop_assert_eq!(c, decoded);
        }
    }
}
