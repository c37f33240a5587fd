use std::mem;

use axum::{handler::Handler, routing::get, Router};

use crate::{api, AppState};

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const WS: &str = "/ws";
    pub const REQUEST_RESOURCE: &str = "/requestResource";
    pub const HEALTHZ: &str = "/healthz";
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder.route_get(paths::WS, api::ws::ws_handler);
    builder.route_get(paths::REQUEST_RESOURCE, api::poll::request_resource);
    builder.route_get(paths::HEALTHZ, api::meta::healthz);
    builder.build()
}
