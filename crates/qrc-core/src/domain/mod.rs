//! Domain layer: client-side session bookkeeping with no I/O.

pub mod change_group;
