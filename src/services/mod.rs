pub mod auto_rule;
pub mod evidence;
pub mod invoker;
pub mod jobs;
pub mod parser;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod snapshot;
pub mod worker;
