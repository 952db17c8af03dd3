//! Utilidades compartidas por los tests: servidores HTTP locales que hacen
//! de backend externo.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

/// Levanta `router` en un puerto efímero de loopback y devuelve su dirección.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Dirección en la que no escucha nadie.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
