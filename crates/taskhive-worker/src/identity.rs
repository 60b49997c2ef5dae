// Worker identity

use taskhive_core::ExecutorInstance;
use uuid::Uuid;

/// Identity of one worker process, used as the executor instance id in
/// every claim it takes.
#[derive(Debug, Clone)]
pub struct ExecutorIdentity {
    pub instance_id: String,
    pub hostname: String,
    pub pid: i64,
    pub version: String,
}

impl ExecutorIdentity {
    /// Generate a `{hostname}-{pid}-{uuid}` identity for this process.
    pub fn generate(version: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        let pid = std::process::id() as i64;
        ExecutorIdentity {
            instance_id: format!("{hostname}-{pid}-{}", Uuid::now_v7()),
            hostname,
            pid,
            version: version.into(),
        }
    }

    /// Build the registry row for this identity with fresh timestamps.
    pub fn to_instance(&self) -> ExecutorInstance {
        ExecutorInstance::new(
            &self.instance_id,
            &self.hostname,
            self.pid,
            &self.version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identities_are_unique_and_valid() {
        let a = ExecutorIdentity::generate("0.2.0");
        let b = ExecutorIdentity::generate("0.2.0");
        assert_ne!(a.instance_id, b.instance_id);
        assert!(a.pid > 0);
        assert!(a.to_instance().validate().is_ok());
    }
}
