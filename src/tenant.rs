use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::directory::WorkerDirectory;
use crate::engine::Engine;
use crate::limits::*;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    directory: Arc<dyn WorkerDirectory>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, directory: Arc<dyn WorkerDirectory>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            directory,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; only one engine
        // may own the WAL, so creation happens under the map's entry lock.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.directory.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("tenant {safe_name} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{OpenDirectory, StaticDirectory};
    use crate::engine::EngineError;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("exambook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Arc::new(OpenDirectory))
    }

    fn plan_request(id: Ulid) -> NewPlan {
        NewPlan {
            id,
            year: 2026,
            name: "Yearly checkups".into(),
            targets: Targets {
                total: 50,
                ..Targets::default()
            },
            period_start: 1_767_225_600_000,
            period_end: 1_798_761_600_000,
            approver: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("site_a").unwrap();
        let eng_b = tm.get_or_create("site_b").unwrap();

        // Same plan id in both tenants
        let pid = Ulid::new();
        eng_a.create_plan(plan_request(pid)).await.unwrap();
        eng_b.create_plan(plan_request(pid)).await.unwrap();

        eng_a.approve_plan(pid, None).await.unwrap();

        assert_eq!(eng_a.get_plan(pid).await.unwrap().status, PlanStatus::Approved);
        assert_eq!(eng_b.get_plan(pid).await.unwrap().status, PlanStatus::Draft);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();

        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();

        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_shares_worker_directory() {
        let dir = test_data_dir("directory");
        let tm = TenantManager::new(dir, 1000, Arc::new(StaticDirectory::new(["W-1"])));
        let engine = tm.get_or_create("roster").unwrap();

        let pid = Ulid::new();
        engine.create_plan(plan_request(pid)).await.unwrap();
        engine.approve_plan(pid, None).await.unwrap();
        let schedule = engine
            .create_schedule(NewSchedule {
                id: Ulid::new(),
                plan_id: pid,
                start: 1_772_442_000_000,
                end: 1_772_456_400_000,
                institution: Institution {
                    name: "Clinic".into(),
                    ..Institution::default()
                },
                exam_types: [ExamType::General].into_iter().collect(),
                capacity: 5,
            })
            .await
            .unwrap();

        let err = engine
            .create_reservation(NewReservation {
                id: Ulid::new(),
                schedule_id: schedule.id,
                worker_ref: "W-2".into(),
                exam_types: [ExamType::General].into_iter().collect(),
                delivery: Delivery::default(),
                contact: Contact::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerNotFound(_)));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        // Path traversal attempt
        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
