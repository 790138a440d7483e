use sea_orm_migration::prelude::*;

use crate::migrations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(migrations::m202608280001_create_sessions::Migration),
            Box::new(migrations::m202608280002_create_tokens::Migration),
            Box::new(migrations::m202608280003_create_attendance_records::Migration),
            Box::new(migrations::m202608280004_create_pending_intents::Migration),
        ]
    }
}
