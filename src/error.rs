use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Broken pipe: {0}")]
    BrokenPipe(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Prometheus error: {0}")]
    Prometheus(String),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Table conflict: {0}")]
    TableConflict(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeteringError {
    // Transient failures are absorbed by client retry budgets or queue
    // requeues; everything else either requeues on its own terms or is
    // terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeteringError::Io(_)
                | MeteringError::Connect(_)
                | MeteringError::BrokenPipe(_)
                | MeteringError::Query(_)
                | MeteringError::Prometheus(_)
        )
    }

    // Terminal failures drive a resource into the Failed phase with no
    // further retries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MeteringError::Validation(_)
                | MeteringError::TableConflict(_)
                | MeteringError::DependencyCycle(_)
                | MeteringError::Render(_)
        )
    }

    pub fn is_retriable(&self) -> bool {
        !self.is_terminal() && !matches!(self, MeteringError::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, MeteringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(MeteringError::BrokenPipe("eof".into()).is_transient());
        assert!(!MeteringError::Validation("bad window".into()).is_transient());
        assert!(MeteringError::Validation("bad window".into()).is_terminal());
        assert!(MeteringError::DependencyCycle("a -> b -> a".into()).is_terminal());
        assert!(!MeteringError::DependencyNotReady("view".into()).is_terminal());
        assert!(MeteringError::DependencyNotReady("view".into()).is_retriable());
        assert!(!MeteringError::Shutdown.is_retriable());
    }
}
