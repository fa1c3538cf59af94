use sea_orm_migration::prelude::*;

pub use sea_orm_migration::MigratorTrait;

mod m0001_create_tasks;
mod m0002_add_task_claims;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_tasks::Migration),
            Box::new(m0002_add_task_claims::Migration),
        ]
    }
}
