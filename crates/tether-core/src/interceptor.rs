//! Raw datagram interception.
//!
//! An interceptor sees every datagram before the host decodes it and after the host
//! has fully encoded one. It can rewrite the bytes in place or consume the datagram so
//! the protocol never sees it, which is how applications bolt on raw inspection,
//! out-of-band discovery traffic, or obfuscation.

use std::net::SocketAddr;

/// What the host should do with a datagram after the interceptor has looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// Hand the (possibly rewritten) datagram on to the protocol or socket.
    Process,
    /// The interceptor consumed the datagram; skip it.
    Consume,
}

/// Hook invoked on raw datagrams at the socket boundary.
///
/// # Examples
/// ```
/// use std::net::SocketAddr;
/// use tether_core::interceptor::{InterceptAction, Interceptor};
///
/// struct ProbeFilter;
///
/// impl Interceptor for ProbeFilter {
///     fn on_receive(&mut self, _addr: &SocketAddr, data: &mut [u8]) -> InterceptAction {
///         if data.starts_with(b"PROBE") {
///             InterceptAction::Consume
///         } else {
///             InterceptAction::Process
///         }
///     }
/// }
/// ```
pub trait Interceptor: Send {
    /// Called with each received datagram before header decoding.
    fn on_receive(&mut self, addr: &SocketAddr, data: &mut [u8]) -> InterceptAction;

    /// Called with each encoded datagram right before it is written to the socket.
    fn on_send(&mut self, _addr: &SocketAddr, _data: &mut Vec<u8>) -> InterceptAction {
        InterceptAction::Process
    }
}

/// Interceptor that lets every datagram through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpInterceptor;

impl Interceptor for NoOpInterceptor {
    fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> InterceptAction {
        InterceptAction::Process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7777)
    }

    struct XorInterceptor(u8);

    impl Interceptor for XorInterceptor {
        fn on_receive(&mut self, _addr: &SocketAddr, data: &mut [u8]) -> InterceptAction {
            data.iter_mut().for_each(|byte| *byte ^= self.0);
            InterceptAction::Process
        }

        fn on_send(&mut self, _addr: &SocketAddr, data: &mut Vec<u8>) -> InterceptAction {
            data.iter_mut().for_each(|byte| *byte ^= self.0);
            InterceptAction::Process
        }
    }

    #[test]
    fn test_xor_interceptor_restores_bytes() {
        let mut interceptor = XorInterceptor(0x5A);
        let mut data = vec![0x00, 0x80, 0xFF];
        let original = data.clone();

        assert_eq!(interceptor.on_send(&addr(), &mut data), InterceptAction::Process);
        assert_ne!(data, original);
        assert_eq!(interceptor.on_receive(&addr(), &mut data), InterceptAction::Process);
        assert_eq!(data, original);
    }

    #[test]
    fn test_default_on_send_processes() {
        struct ReceiveOnly;
        impl Interceptor for ReceiveOnly {
            fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> InterceptAction {
                InterceptAction::Consume
            }
        }

        let mut interceptor = ReceiveOnly;
        let mut data = vec![1, 2, 3];
        assert_eq!(interceptor.on_receive(&addr(), &mut data), InterceptAction::Consume);
        assert_eq!(interceptor.on_send(&addr(), &mut data), InterceptAction::Process);
    }

    #[test]
    fn test_noop_interceptor() {
        let mut interceptor = NoOpInterceptor;
        let mut data = vec![1, 2, 3];
        assert_eq!(interceptor.on_receive(&addr(), &mut data), InterceptAction::Process);
        assert_eq!(data, vec![1, 2, 3]);
    }
}
