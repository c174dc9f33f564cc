// =============================================================================
// HTTP / WebSocket surface
// =============================================================================
//
//   - auth: constant-time bearer-token validation
//   - rest: the /api/v1 order, position and diagnostics endpoints
//   - ws:   push feed of engine events
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
