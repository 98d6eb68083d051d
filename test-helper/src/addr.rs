use std::net::{SocketAddr, TcpListener};

/// Gets a new socket address allocated by the OS.
///
/// Nothing listens on the address once this returns.
pub fn get_unused_addr() -> SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

/// Binds a listener on an OS allocated address.
///
/// Connections are accepted by the kernel backlog for as long as the
/// listener is alive, which is all a reachability probe needs.
pub fn bind_unused_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}
