//! Schema migrations for the durable backend.

use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(CreateEngineTables)]
    }
}

#[derive(DeriveMigrationName)]
pub struct CreateEngineTables;

#[async_trait::async_trait]
impl MigrationTrait for CreateEngineTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExecutionPlans::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ExecutionPlans::Id).string().primary_key())
                    .col(
                        ColumnDef::new(ExecutionPlans::TaskSignature)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(ExecutionPlans::Instruction).text().not_null())
                    .col(ColumnDef::new(ExecutionPlans::Url).text().not_null())
                    .col(ColumnDef::new(ExecutionPlans::Plan).json().not_null())
                    .col(
                        ColumnDef::new(ExecutionPlans::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExecutionPlans::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExecutionPlans::Version)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(ExecutionPlans::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PlanCache::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PlanCache::Id)
                            .integer()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PlanCache::CacheKey)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PlanCache::PlanId).string().not_null())
                    .col(
                        ColumnDef::new(PlanCache::HitCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PlanCache::LastUsedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PlanCache::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PlanCache::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_plan_cache_expires_at")
                    .table(PlanCache::Table)
                    .col(PlanCache::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ExecutionResults::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ExecutionResults::Id).string().primary_key())
                    .col(ColumnDef::new(ExecutionResults::TaskId).string())
                    .col(ColumnDef::new(ExecutionResults::PlanId).string())
                    .col(ColumnDef::new(ExecutionResults::Status).string().not_null())
                    .col(ColumnDef::new(ExecutionResults::Result).json())
                    .col(ColumnDef::new(ExecutionResults::Logs).json())
                    .col(ColumnDef::new(ExecutionResults::ErrorMessage).text())
                    .col(
                        ColumnDef::new(ExecutionResults::ExecutionTimeMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionResults::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MonitoringData::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(MonitoringData::Id).string().primary_key())
                    .col(ColumnDef::new(MonitoringData::TaskId).string().not_null())
                    .col(ColumnDef::new(MonitoringData::Url).text().not_null())
                    .col(
                        ColumnDef::new(MonitoringData::ExtractedData)
                            .json()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MonitoringData::ExecutionId).string())
                    .col(
                        ColumnDef::new(MonitoringData::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_monitoring_data_task_timestamp")
                    .table(MonitoringData::Table)
                    .col(MonitoringData::TaskId)
                    .col(MonitoringData::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ChangeDetections::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ChangeDetections::Id).string().primary_key())
                    .col(ColumnDef::new(ChangeDetections::TaskId).string().not_null())
                    .col(ColumnDef::new(ChangeDetections::ExecutionId).string())
                    .col(
                        ColumnDef::new(ChangeDetections::ChangedFields)
                            .json()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ChangeDetections::IsRestock)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ChangeDetections::ChangeDetails).json())
                    .col(
                        ColumnDef::new(ChangeDetections::DetectedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in [
            Table::drop().table(ChangeDetections::Table).to_owned(),
            Table::drop().table(MonitoringData::Table).to_owned(),
            Table::drop().table(ExecutionResults::Table).to_owned(),
            Table::drop().table(PlanCache::Table).to_owned(),
            Table::drop().table(ExecutionPlans::Table).to_owned(),
        ] {
            manager.drop_table(table).await?;
        }
        Ok(())
    }
}

#[derive(DeriveIden)]
enum ExecutionPlans {
    Table,
    Id,
    TaskSignature,
    Instruction,
    Url,
    Plan,
    CreatedAt,
    UpdatedAt,
    Version,
    IsActive,
}

#[derive(DeriveIden)]
enum PlanCache {
    Table,
    Id,
    CacheKey,
    PlanId,
    HitCount,
    LastUsedAt,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ExecutionResults {
    Table,
    Id,
    TaskId,
    PlanId,
    Status,
    Result,
    Logs,
    ErrorMessage,
    ExecutionTimeMs,
    CreatedAt,
}

#[derive(DeriveIden)]
enum MonitoringData {
    Table,
    Id,
    TaskId,
    Url,
    ExtractedData,
    ExecutionId,
    Timestamp,
}

#[derive(DeriveIden)]
enum ChangeDetections {
    Table,
    Id,
    TaskId,
    ExecutionId,
    ChangedFields,
    IsRestock,
    DetectedAt,
    ChangeDetails,
}
