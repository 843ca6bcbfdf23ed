//! Query definitions and the results that mirror them

mod def;
mod result;

pub use def::{PageCursor, QueryDef, ViewQueryDef, ViewQueryKind};
pub use result::{ListQueryResult, QueryResult, RefQueryResult, ValueQueryResult, ViewQueryResult};
