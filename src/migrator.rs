use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_products_table::Migration),
            Box::new(m20260101_000002_create_inventory_movements_table::Migration),
            Box::new(m20260101_000003_create_orders_table::Migration),
            Box::new(m20260101_000004_create_order_items_table::Migration),
            Box::new(m20260101_000005_create_picking_sessions_table::Migration),
            Box::new(m20260101_000006_create_picking_progress_table::Migration),
            Box::new(m20260101_000007_create_packing_progress_table::Migration),
            Box::new(m20260101_000008_add_progress_indexes::Migration),
        ]
    }
}

// Migration implementations

mod m20260101_000001_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000001_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Sku).string().not_null().unique_key())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(
                            ColumnDef::new(Products::CurrentStock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::UnitCost).decimal().not_null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Products {
        Table,
        Id,
        Sku,
        Name,
        CurrentStock,
        UnitCost,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000002_create_inventory_movements_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000002_create_inventory_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryMovements::ProductId).uuid().not_null())
                        .col(ColumnDef::new(InventoryMovements::Delta).integer().not_null())
                        .col(
                            ColumnDef::new(InventoryMovements::ResultingStock)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryMovements::ReferenceType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryMovements::ReferenceId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_movements_product")
                        .table(InventoryMovements::Table)
                        .col(InventoryMovements::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_movements_reference")
                        .table(InventoryMovements::Table)
                        .col(InventoryMovements::ReferenceType)
                        .col(InventoryMovements::ReferenceId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryMovements::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum InventoryMovements {
        Table,
        Id,
        ProductId,
        Delta,
        ResultingStock,
        ReferenceType,
        ReferenceId,
        CreatedAt,
    }
}

mod m20260101_000003_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000003_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Orders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::TenantId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::PickingSessionId).uuid())
                        .col(ColumnDef::new(Orders::Notes).string())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone())
                        .col(
                            ColumnDef::new(Orders::Version)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_session")
                        .table(Orders::Table)
                        .col(Orders::PickingSessionId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Orders {
        Table,
        Id,
        OrderNumber,
        TenantId,
        Status,
        PickingSessionId,
        Notes,
        CreatedAt,
        UpdatedAt,
        Version,
    }
}

mod m20260101_000004_create_order_items_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000004_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_order_items_order")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        Quantity,
        CreatedAt,
    }
}

mod m20260101_000005_create_picking_sessions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000005_create_picking_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PickingSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PickingSessions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingSessions::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PickingSessions::TenantId).uuid().not_null())
                        .col(ColumnDef::new(PickingSessions::Status).string().not_null())
                        .col(
                            ColumnDef::new(PickingSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PickingSessions::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PickingSessions::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PickingSessions {
        Table,
        Id,
        Code,
        TenantId,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000006_create_picking_progress_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000006_create_picking_progress_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PickingProgress::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PickingProgress::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PickingProgress::SessionId).uuid().not_null())
                        .col(ColumnDef::new(PickingProgress::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(PickingProgress::QuantityNeeded)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingProgress::QuantityPicked)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(PickingProgress::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PickingProgress::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PickingProgress {
        Table,
        Id,
        SessionId,
        ProductId,
        QuantityNeeded,
        QuantityPicked,
        UpdatedAt,
    }
}

mod m20260101_000007_create_packing_progress_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000007_create_packing_progress_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PackingProgress::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PackingProgress::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PackingProgress::SessionId).uuid().not_null())
                        .col(ColumnDef::new(PackingProgress::OrderId).uuid().not_null())
                        .col(ColumnDef::new(PackingProgress::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(PackingProgress::QuantityNeeded)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingProgress::QuantityPacked)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(PackingProgress::UpdatedAt).timestamp_with_time_zone())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PackingProgress::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PackingProgress {
        Table,
        Id,
        SessionId,
        OrderId,
        ProductId,
        QuantityNeeded,
        QuantityPacked,
        UpdatedAt,
    }
}

mod m20260101_000008_add_progress_indexes {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000008_add_progress_indexes"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // One progress row per (session, product) and one packing row
            // per (session, order, product); the bounded-increment
            // primitives rely on these keys addressing a single row.
            manager
                .create_index(
                    Index::create()
                        .name("uq_picking_progress_session_product")
                        .table(PickingProgress::Table)
                        .col(PickingProgress::SessionId)
                        .col(PickingProgress::ProductId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("uq_packing_progress_session_order_product")
                        .table(PackingProgress::Table)
                        .col(PackingProgress::SessionId)
                        .col(PackingProgress::OrderId)
                        .col(PackingProgress::ProductId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_index(
                    Index::drop()
                        .name("uq_picking_progress_session_product")
                        .table(PickingProgress::Table)
                        .to_owned(),
                )
                .await?;

            manager
                .drop_index(
                    Index::drop()
                        .name("uq_packing_progress_session_order_product")
                        .table(PackingProgress::Table)
                        .to_owned(),
                )
                .await
        }
    }

    #[derive(Iden)]
    enum PickingProgress {
        Table,
        SessionId,
        ProductId,
    }

    #[derive(Iden)]
    enum PackingProgress {
        Table,
        SessionId,
        OrderId,
        ProductId,
    }
}
