//! Bus address handling.
//!
//! Addresses follow the D-Bus address grammar: a transport name, a colon,
//! and a comma-separated list of `key=value` options. Multiple addresses may
//! be separated by semicolons and are tried in order.
//!
//! https://dbus.freedesktop.org/doc/dbus-specification.html#addresses

use std::env;
use std::path::PathBuf;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `unix:path=…`: a filesystem socket.
    UnixPath(PathBuf),

    /// `unix:abstract=…`: a socket in the Linux abstract namespace (leading
    /// NUL in the socket address).
    UnixAbstract(Vec<u8>),
}

/// A parsed bus address: one or more transports, tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    transports: Vec<Transport>,
}

impl Address {
    pub fn parse(address: &str) -> crate::Result<Self> {
        let mut transports = Vec::new();

        for entry in address.split(';').filter(|entry| !entry.is_empty()) {
            if let Some(transport) = parse_entry(entry)? {
                transports.push(transport);
            }
        }

        if transports.is_empty() {
            return Err(Error::Address(format!(
                "no supported transport in {:?}",
                address
            )));
        }

        Ok(Self { transports })
    }

    /// The address of the session bus: `DBUS_SESSION_BUS_ADDRESS`, falling
    /// back to `$XDG_RUNTIME_DIR/bus`.
    pub fn session() -> crate::Result<Self> {
        match env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(address) => Self::parse(&address),
            Err(_) => {
                let runtime_dir = env::var("XDG_RUNTIME_DIR")
                    .unwrap_or_else(|_| format!("/run/user/{}", nix::unistd::geteuid().as_raw()));
                Self::parse(&format!("unix:path={}/bus", runtime_dir))
            }
        }
    }

    /// The address of the system bus: `DBUS_SYSTEM_BUS_ADDRESS`, falling
    /// back to the well-known socket path.
    pub fn system() -> crate::Result<Self> {
        match env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            Ok(address) => Self::parse(&address),
            Err(_) => Self::parse("unix:path=/var/run/dbus/system_bus_socket"),
        }
    }

    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }
}

/// Parse one semicolon-separated entry. `Ok(None)` for transports this
/// implementation does not speak, which are skipped while alternatives
/// remain.
fn parse_entry(entry: &str) -> crate::Result<Option<Transport>> {
    let colon = entry
        .find(':')
        .ok_or_else(|| Error::Address(format!("{:?} has no colon", entry)))?;
    let (transport, options) = (&entry[..colon], &entry[colon + 1..]);

    if transport != "unix" {
        log::debug!("Skipping unsupported transport {:?}.", transport);
        return Ok(None);
    }

    let mut path = None;
    let mut abstract_name = None;

    for pair in options.split(',').filter(|pair| !pair.is_empty()) {
        let eq = pair
            .find('=')
            .ok_or_else(|| Error::Address(format!("missing = in {:?}", pair)))?;
        let (key, value) = (&pair[..eq], &pair[eq + 1..]);
        match key {
            "path" => path = Some(value.to_string()),
            "abstract" => abstract_name = Some(value.to_string()),
            // The guid is advisory and unused; other keys are for transports
            // we do not speak.
            "guid" => {}
            _ => {
                return Err(Error::Address(format!(
                    "unsupported key {:?} in unix address",
                    key
                )));
            }
        }
    }

    match (path, abstract_name) {
        (Some(path), None) => Ok(Some(Transport::UnixPath(PathBuf::from(path)))),
        (None, Some(name)) => Ok(Some(Transport::UnixAbstract(name.into_bytes()))),
        _ => Err(Error::Address(format!(
            "unix address needs exactly one of path= or abstract=, got {:?}",
            entry
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_path() {
        let address = Address::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(
            address.transports(),
            &[Transport::UnixPath(PathBuf::from("/run/user/1000/bus"))]
        );
    }

    #[test]
    fn parse_unix_abstract() {
        let address = Address::parse("unix:abstract=/tmp/dbus-qwerty").unwrap();
        assert_eq!(
            address.transports(),
            &[Transport::UnixAbstract(b"/tmp/dbus-qwerty".to_vec())]
        );
    }

    #[test]
    fn alternatives_keep_their_order() {
        let address =
            Address::parse("unix:abstract=/tmp/dbus-1;unix:path=/tmp/dbus-2").unwrap();
        assert_eq!(
            address.transports(),
            &[
                Transport::UnixAbstract(b"/tmp/dbus-1".to_vec()),
                Transport::UnixPath(PathBuf::from("/tmp/dbus-2")),
            ]
        );
    }

    #[test]
    fn unsupported_transports_are_skipped_when_alternatives_remain() {
        let address =
            Address::parse("tcp:host=localhost,port=1234;unix:path=/tmp/bus").unwrap();
        assert_eq!(
            address.transports(),
            &[Transport::UnixPath(PathBuf::from("/tmp/bus"))]
        );

        assert!(Address::parse("tcp:host=localhost,port=1234").is_err());
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("unix").is_err());
        assert!(Address::parse("unix:").is_err());
        assert!(Address::parse("unix:path=/a,abstract=/b").is_err());
        assert!(Address::parse("unix:pathless").is_err());
    }

    #[test]
    fn guid_is_accepted_and_ignored() {
        let address =
            Address::parse("unix:path=/tmp/bus,guid=0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(
            address.transports(),
            &[Transport::UnixPath(PathBuf::from("/tmp/bus"))]
        );
    }
}
