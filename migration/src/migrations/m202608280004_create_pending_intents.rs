use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m202608280004_create_pending_intents"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Client-side durable queue; no foreign keys, because the referenced
        // token/session live in the server store which may be unreachable
        // when a row is written here.
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("pending_intents"))
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Alias::new("local_id"))
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("token_id"))
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("user_id"))
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Alias::new("lat")).double().null())
                    .col(ColumnDef::new(Alias::new("lng")).double().null())
                    .col(ColumnDef::new(Alias::new("accuracy_m")).double().null())
                    .col(
                        ColumnDef::new(Alias::new("captured_at"))
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("sync_state"))
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Alias::new("reject_reason")).string().null())
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp()
                            .not_null()
                            .default(Expr::cust("CURRENT_TIMESTAMP")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_pending_intents_state_captured")
                    .table(Alias::new("pending_intents"))
                    .col(Alias::new("sync_state"))
                    .col(Alias::new("captured_at"))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(Alias::new("pending_intents"))
                    .to_owned(),
            )
            .await
    }
}
