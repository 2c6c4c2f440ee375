mod check;
mod query;
mod reset;
mod run;

pub use check::cmd_check;
pub use query::cmd_query;
pub use reset::cmd_reset;
pub use run::cmd_run;
