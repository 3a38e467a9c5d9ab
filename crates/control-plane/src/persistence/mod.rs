use sqlx::SqlitePool;

pub mod bans;
pub mod migrations;
pub mod settings;
pub mod tasks;

pub type Db = SqlitePool;

pub use bans::{BannedClientRecord, NewBan};
pub use migrations::MigrationSnapshot;
pub use tasks::{NewTask, TaskRecord, TaskTrigger};
