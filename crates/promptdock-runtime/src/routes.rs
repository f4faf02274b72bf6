//! Seam between the supervisor and the public routing surface.

use async_trait::async_trait;

/// Reverse-proxy route registration consumed by the supervisor, rebuild
/// controller, and speculative launcher. The server crate provides the
/// production implementation; tests substitute recording fakes.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Expose `/runtime/<id>/*` proxied to `127.0.0.1:<port>`.
    async fn register(&self, id: &str, port: u16);

    /// Drop the route for `id`, leaving every other live route intact.
    /// Deregistering an absent id is a no-op.
    async fn deregister(&self, id: &str);
}

pub mod testing {
    //! Recording route-table fake.

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::RouteTable;

    #[derive(Default)]
    pub struct RecordingRouteTable {
        routes: Mutex<Vec<(String, u16)>>,
        events: Mutex<Vec<String>>,
    }

    impl RecordingRouteTable {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn has_route(&self, id: &str) -> bool {
            self.routes.lock().iter().any(|(rid, _)| rid == id)
        }

        pub fn port_of(&self, id: &str) -> Option<u16> {
            self.routes
                .lock()
                .iter()
                .find(|(rid, _)| rid == id)
                .map(|(_, port)| *port)
        }

        pub fn active_count(&self) -> usize {
            self.routes.lock().len()
        }

        /// `register:<id>:<port>` / `deregister:<id>` in call order.
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl RouteTable for RecordingRouteTable {
        async fn register(&self, id: &str, port: u16) {
            self.events.lock().push(format!("register:{id}:{port}"));
            let mut routes = self.routes.lock();
            routes.retain(|(rid, _)| rid != id);
            routes.push((id.to_string(), port));
        }

        async fn deregister(&self, id: &str) {
            self.events.lock().push(format!("deregister:{id}"));
            self.routes.lock().retain(|(rid, _)| rid != id);
        }
    }
}
