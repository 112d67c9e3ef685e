//! 数据库查询操作
//!
//! PostgreSQL上的 [`MetadataStore`] 实现。各层记录均依赖唯一约束，
//! 通过 `INSERT ... ON CONFLICT DO NOTHING` 加回查实现并发安全的 get-or-create。

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::*;
use async_trait::async_trait;
use pacs_core::{Facility, Instance, Patient, Result, Series, Study, StudyStatus};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// 数据库查询操作接口
#[derive(Clone)]
pub struct DatabaseQueries {
    pool: DatabasePool,
}

impl DatabaseQueries {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 机构与用户表由管理端维护，这里只保证存在最小结构
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS facilities (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                ae_title VARCHAR(16) NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
        "#).execute(pool).await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_facilities_ae_title ON facilities (UPPER(ae_title))"
        ).execute(pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                role VARCHAR(32) NOT NULL,
                facility_id UUID REFERENCES facilities(id),
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
        "#).execute(pool).await?;

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                patient_id VARCHAR(64) UNIQUE NOT NULL,
                first_name VARCHAR(255) NOT NULL,
                last_name VARCHAR(255) NOT NULL,
                sex CHAR(1),
                birth_date DATE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建检查表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS studies (
                id UUID PRIMARY KEY,
                study_uid VARCHAR(64) UNIQUE NOT NULL,
                patient_id UUID NOT NULL REFERENCES patients(id),
                facility_id UUID NOT NULL REFERENCES facilities(id),
                accession_number VARCHAR(64) NOT NULL,
                study_date DATE,
                study_time TIME,
                modality VARCHAR(16) NOT NULL,
                description TEXT NOT NULL,
                referring_physician VARCHAR(255),
                status VARCHAR(20) NOT NULL DEFAULT 'SCHEDULED',
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建系列表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS series (
                id UUID PRIMARY KEY,
                series_uid VARCHAR(64) UNIQUE NOT NULL,
                study_id UUID NOT NULL REFERENCES studies(id),
                modality VARCHAR(16) NOT NULL,
                series_number INTEGER NOT NULL,
                description TEXT,
                slice_thickness DOUBLE PRECISION,
                pixel_spacing DOUBLE PRECISION[],
                image_orientation DOUBLE PRECISION[],
                images_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建实例表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS instances (
                id UUID PRIMARY KEY,
                sop_instance_uid VARCHAR(64) UNIQUE NOT NULL,
                series_id UUID NOT NULL REFERENCES series(id),
                instance_number INTEGER,
                image_position DOUBLE PRECISION[],
                slice_location DOUBLE PRECISION,
                file_path VARCHAR(512) NOT NULL,
                file_size BIGINT NOT NULL,
                checksum CHAR(64) NOT NULL,
                transfer_syntax_uid VARCHAR(64) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_studies_facility_id ON studies(facility_id)",
            "CREATE INDEX IF NOT EXISTS idx_studies_accession_number ON studies(accession_number)",
            "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_series_id ON instances(series_id)",
            "CREATE INDEX IF NOT EXISTS idx_users_facility_id ON users(facility_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    // ========== 事务内的 get-or-create ==========

    async fn get_or_create_patient(
        tx: &mut Transaction<'_, Postgres>,
        patient: &NewPatient,
    ) -> Result<(Patient, bool)> {
        let inserted = sqlx::query_as::<_, DbPatient>(r#"
            INSERT INTO patients (id, patient_id, first_name, last_name, sex, birth_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (patient_id) DO NOTHING
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&patient.patient_id)
        .bind(&patient.first_name)
        .bind(&patient.last_name)
        .bind(patient.sex.map(|s| s.code()))
        .bind(patient.birth_date)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE patient_id = $1")
            .bind(&patient.patient_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok((existing.into(), false))
    }

    async fn get_or_create_study(
        tx: &mut Transaction<'_, Postgres>,
        study: &NewStudy,
        patient_id: Uuid,
        facility_id: Uuid,
    ) -> Result<(Study, bool)> {
        let inserted = sqlx::query_as::<_, DbStudy>(r#"
            INSERT INTO studies (id, study_uid, patient_id, facility_id, accession_number,
                                 study_date, study_time, modality, description,
                                 referring_physician, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (study_uid) DO NOTHING
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&study.study_uid)
        .bind(patient_id)
        .bind(facility_id)
        .bind(&study.accession_number)
        .bind(study.study_date)
        .bind(study.study_time)
        .bind(&study.modality)
        .bind(&study.description)
        .bind(&study.referring_physician)
        .bind(StudyStatus::Scheduled.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        // 已存在的检查：机构归属保持不变
        let existing = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(&study.study_uid)
            .fetch_one(&mut **tx)
            .await?;
        Ok((existing.into(), false))
    }

    async fn get_or_create_series(
        tx: &mut Transaction<'_, Postgres>,
        series: &NewSeries,
        study_id: Uuid,
    ) -> Result<(Series, bool)> {
        let inserted = sqlx::query_as::<_, DbSeries>(r#"
            INSERT INTO series (id, series_uid, study_id, modality, series_number, description,
                                slice_thickness, pixel_spacing, image_orientation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (series_uid) DO NOTHING
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&series.series_uid)
        .bind(study_id)
        .bind(&series.modality)
        .bind(series.series_number)
        .bind(&series.description)
        .bind(series.slice_thickness)
        .bind(series.pixel_spacing.map(|v| v.to_vec()))
        .bind(series.image_orientation.map(|v| v.to_vec()))
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_uid = $1")
            .bind(&series.series_uid)
            .fetch_one(&mut **tx)
            .await?;
        Ok((existing.into(), false))
    }

    async fn get_or_create_instance(
        tx: &mut Transaction<'_, Postgres>,
        instance: &NewInstance,
        series_id: Uuid,
    ) -> Result<(Instance, bool)> {
        let inserted = sqlx::query_as::<_, DbInstance>(r#"
            INSERT INTO instances (id, sop_instance_uid, series_id, instance_number, image_position,
                                   slice_location, file_path, file_size, checksum, transfer_syntax_uid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (sop_instance_uid) DO NOTHING
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&instance.sop_instance_uid)
        .bind(series_id)
        .bind(instance.instance_number)
        .bind(instance.image_position.map(|v| v.to_vec()))
        .bind(instance.slice_location)
        .bind(&instance.file_path)
        .bind(instance.file_size)
        .bind(&instance.checksum)
        .bind(&instance.transfer_syntax_uid)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing =
            sqlx::query_as::<_, DbInstance>("SELECT * FROM instances WHERE sop_instance_uid = $1")
                .bind(&instance.sop_instance_uid)
                .fetch_one(&mut **tx)
                .await?;
        Ok((existing.into(), false))
    }
}

#[async_trait]
impl MetadataStore for DatabaseQueries {
    async fn active_facilities(&self) -> Result<Vec<Facility>> {
        let rows = sqlx::query_as::<_, DbFacility>(
            "SELECT id, name, ae_title, is_active FROM facilities WHERE is_active",
        )
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Facility::from).collect())
    }

    async fn upsert_instance(&self, record: InstanceRecord) -> Result<UpsertOutcome> {
        let mut tx = self.pool.pool().begin().await?;

        let (patient, patient_created) = Self::get_or_create_patient(&mut tx, &record.patient).await?;
        let (study, study_created) =
            Self::get_or_create_study(&mut tx, &record.study, patient.id, record.facility_id).await?;
        let (mut series, series_created) =
            Self::get_or_create_series(&mut tx, &record.series, study.id).await?;
        let (instance, instance_created) =
            Self::get_or_create_instance(&mut tx, &record.instance, series.id).await?;

        if instance_created {
            let count: i32 = sqlx::query(
                "UPDATE series SET images_count = images_count + 1 WHERE id = $1 RETURNING images_count",
            )
            .bind(series.id)
            .fetch_one(&mut *tx)
            .await?
            .get("images_count");
            series.images_count = count;
        }

        // 任一步失败时tx在drop时回滚
        tx.commit().await?;

        Ok(UpsertOutcome {
            patient,
            study,
            series,
            instance,
            patient_created,
            study_created,
            series_created,
            instance_created,
        })
    }

    async fn find_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Patient::from))
    }

    async fn find_study(&self, study_uid: &str) -> Result<Option<Study>> {
        let row = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(study_uid)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Study::from))
    }

    async fn find_series(&self, series_uid: &str) -> Result<Option<Series>> {
        let row = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_uid = $1")
            .bind(series_uid)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Series::from))
    }

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, DbInstance>("SELECT * FROM instances WHERE sop_instance_uid = $1")
            .bind(sop_instance_uid)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(Instance::from))
    }

    async fn series_instances(&self, series_uid: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, DbInstance>(r#"
            SELECT i.* FROM instances i
            JOIN series s ON s.id = i.series_id
            WHERE s.series_uid = $1
        "#)
        .bind(series_uid)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Instance::from).collect())
    }

    async fn recipients(&self, scope: RecipientScope) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, DbRecipient>(
            "SELECT id, role, facility_id FROM users WHERE is_active",
        )
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                RecipientRole::parse(&row.role).map(|role| Recipient {
                    user_id: row.id,
                    role,
                    facility_id: row.facility_id,
                })
            })
            .filter(|r| scope.includes(r))
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(r#"
            SELECT
                (SELECT COUNT(*) FROM patients) AS patients,
                (SELECT COUNT(*) FROM studies) AS studies,
                (SELECT COUNT(*) FROM series) AS series,
                (SELECT COUNT(*) FROM instances) AS instances
        "#)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(StoreCounts {
            patients: row.get::<i64, _>("patients") as u64,
            studies: row.get::<i64, _>("studies") as u64,
            series: row.get::<i64, _>("series") as u64,
            instances: row.get::<i64, _>("instances") as u64,
        })
    }
}
