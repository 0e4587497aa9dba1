//! Wire messages for `creature.Creature/Talk`.
//!
//! Generated by `build.rs` from `proto/creature.proto`.

tonic::include_proto!("creature");

/// RPC path of the duplex call.
pub const TALK_PATH: &str = "/creature.Creature/Talk";
