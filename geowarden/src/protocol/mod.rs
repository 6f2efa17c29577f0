// geowarden/src/protocol/mod.rs
//
// Postfix policy delegation protocol: `name=value` lines terminated by an
// empty line in, a single `action=...` line plus empty line out.

pub mod assembler;
pub mod response;

pub use assembler::RequestAssembler;
pub use response::encode;
