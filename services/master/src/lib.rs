// master: drives a two-node timestamp acquisition session.
//
// Owns the session protocol: readiness handshake, trigger dispatch, status
// polling, bulk file reception, and the post-acquisition offset report.

pub mod config;
pub mod controller;
pub mod peer;
