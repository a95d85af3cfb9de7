//! Network filters.

mod tcp_proxy;

pub use tcp_proxy::{select_route, TcpProxy, TcpProxyFilterFactory, TcpProxyStats};
