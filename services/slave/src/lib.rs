// slave: serves one side of a two-node timestamp acquisition session.
//
// Subscribes to the master's trigger channel, answers its command channel,
// runs the local acquisition pipeline on trigger, and pushes sync frames,
// heartbeats, and data files back.

pub mod agent;
pub mod config;
pub mod peer;
