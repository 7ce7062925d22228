//! Addresses of application entities in a DICOM network.
//!
//! An application entity is reached through a socket address,
//! optionally qualified with the AE title expected at that address.
//! The textual syntax is `«ae_title»@«address»:«port»`,
//! accepting IPv4 and IPv6 addresses as well as domain names.
//! [`AeAddr`] makes the AE title optional,
//! [`FullAeAddr`] requires it.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use snafu::{ensure, AsErrorSource, ResultExt, Snafu};

/// An address to an application entity
/// with a mandatory AE title component.
///
/// # Example
///
/// ```
/// # use dicom_net::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr<String> = "STORE-SCP@192.168.1.99:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert_eq!(addr.socket_addr(), "192.168.1.99:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr<T> {
    ae_title: String,
    socket_addr: T,
}

impl<T> FullAeAddr<T> {
    /// Create an address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// The application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The network address portion.
    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }

    /// Take the address apart.
    pub fn into_parts(self) -> (String, T) {
        (self.ae_title, self.socket_addr)
    }
}

impl<T> From<(String, T)> for FullAeAddr<T> {
    fn from((ae_title, socket_addr): (String, T)) -> Self {
        FullAeAddr::new(ae_title, socket_addr)
    }
}

/// An error parsing an AE address from text.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError<E>
where
    E: std::fmt::Debug + AsErrorSource,
{
    /// Missing `@` separating the AE title from the network address
    MissingPart,

    /// Could not parse network socket address
    ParseSocketAddress { source: E },
}

impl<T> FromStr for FullAeAddr<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug + AsErrorSource,
{
    type Err = ParseAeAddressError<<T as FromStr>::Err>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        ensure!(!ae_title.is_empty(), MissingPartSnafu);
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl<T> ToSocketAddrs for FullAeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl<T> fmt::Display for FullAeAddr<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}

/// An address to an application entity
/// where the AE title component is optional.
///
/// Produced from a string either with or without the `«ae_title»@` part,
/// or through the conversions from socket address types and [`FullAeAddr`].
#[derive(Debug, Clone, PartialEq)]
pub struct AeAddr<T> {
    ae_title: Option<String>,
    socket_addr: T,
}

impl<T> AeAddr<T> {
    /// Create an address with an explicit AE title.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_addr,
        }
    }

    /// Create an address with no AE title.
    pub fn new_socket_addr(socket_addr: T) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }

    /// The application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The network address portion.
    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }
}

impl<T> From<FullAeAddr<T>> for AeAddr<T> {
    fn from(full: FullAeAddr<T>) -> Self {
        let (ae_title, socket_addr) = full.into_parts();
        AeAddr {
            ae_title: Some(ae_title),
            socket_addr,
        }
    }
}

impl From<SocketAddr> for AeAddr<SocketAddr> {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr::new_socket_addr(socket_addr)
    }
}

impl<'a> TryFrom<&'a str> for AeAddr<&'a str> {
    type Error = ParseAeAddressError<std::convert::Infallible>;

    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        ensure!(!ae_title.is_empty(), MissingPartSnafu);
        Ok(AeAddr {
            ae_title: Some(ae_title.to_string()),
            socket_addr: addr,
        })
    }
}

impl<T> ToSocketAddrs for AeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl<T> fmt::Display for AeAddr<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ae_title {
            Some(ae_title) => write!(f, "{}@{}", ae_title, self.socket_addr),
            None => self.socket_addr.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{AeAddr, FullAeAddr, ParseAeAddressError};

    #[test]
    fn full_ae_addr_parses_both_parts() {
        let addr: FullAeAddr<String> = "PACS@10.0.0.7:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "PACS");
        assert_eq!(addr.socket_addr(), "10.0.0.7:11112");
        assert_eq!(addr.to_string(), "PACS@10.0.0.7:11112");

        let addr: FullAeAddr<SocketAddr> = "PACS@10.0.0.7:11112".parse().unwrap();
        assert_eq!(
            addr.socket_addr(),
            &SocketAddr::from(([10, 0, 0, 7], 11112))
        );
    }

    #[test]
    fn missing_ae_title_is_an_error() {
        let err = "10.0.0.7:11112".parse::<FullAeAddr<String>>().unwrap_err();
        assert_eq!(err, ParseAeAddressError::MissingPart);
        let err = "@10.0.0.7:11112".parse::<FullAeAddr<String>>().unwrap_err();
        assert_eq!(err, ParseAeAddressError::MissingPart);
    }

    #[test]
    fn ae_addr_title_is_optional() {
        let addr = AeAddr::try_from("ARCHIVE@localhost:104").unwrap();
        assert_eq!(addr.ae_title(), Some("ARCHIVE"));
        assert_eq!(*addr.socket_addr(), "localhost:104");

        let addr = AeAddr::new_socket_addr("localhost:104");
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.to_string(), "localhost:104");
    }
}
