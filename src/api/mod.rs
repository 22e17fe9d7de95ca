// =============================================================================
// HTTP / WebSocket surface
// =============================================================================
//
// - `rest` : read-only query endpoints under `/api/v1/`
// - `ws`   : subscription protocol over `/api/v1/ws`

pub mod rest;
pub mod ws;

pub use rest::router;
