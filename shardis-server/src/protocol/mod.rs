pub mod resp;

pub use resp::{CmdLine, ProtocolError, Reply, RespParser, to_cmdline};
