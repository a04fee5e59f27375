//! Connection construction
//!
//! The executor never names a transport: it asks a [`ConnectionFactory`] for
//! a connection to each target, so tests can swap in scripted connections.

use async_trait::async_trait;

use fanout_exec::{
    Connection, ContainerConnection, ContainerRuntime, ExecError, LocalConnection, LxdConnection,
    SshConnection, Target, TransportKind, WinrmConnection,
};

/// Factory trait for creating per-target connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create an unconnected connection for `target`
    ///
    /// # Errors
    /// Returns `ExecError::Validation` if the target cannot be served
    async fn create(&self, target: &Target) -> Result<Box<dyn Connection>, ExecError>;
}

/// Factory selecting the connection variant from the target's transport
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnectionFactory;

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn create(&self, target: &Target) -> Result<Box<dyn Connection>, ExecError> {
        target.validate()?;
        let target = target.clone();
        let conn: Box<dyn Connection> = match target.transport {
            TransportKind::Ssh => Box::new(SshConnection::new(target)),
            TransportKind::Winrm => Box::new(WinrmConnection::new(target)),
            TransportKind::Local => Box::new(LocalConnection::new(target)),
            TransportKind::Lxd => Box::new(LxdConnection::new(target)),
            kind @ (TransportKind::Docker | TransportKind::Podman) => {
                let runtime = ContainerRuntime::for_transport(kind).ok_or_else(|| {
                    ExecError::Validation(format!("{kind} is not a container runtime"))
                })?;
                Box::new(ContainerConnection::new(target, runtime))
            }
        };
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_selects_transport() {
        let factory = DefaultConnectionFactory;
        for (kind, name) in [
            (TransportKind::Local, "local"),
            (TransportKind::Ssh, "ssh"),
            (TransportKind::Docker, "docker"),
            (TransportKind::Podman, "podman"),
            (TransportKind::Lxd, "lxd"),
        ] {
            let conn = factory.create(&Target::new("t", kind)).await.unwrap();
            assert_eq!(conn.transport_name(), name);
        }

        let winrm = Target::new("w", TransportKind::Winrm)
            .with_user("Administrator")
            .with_password("secret");
        let conn = factory.create(&winrm).await.unwrap();
        assert_eq!(conn.transport_name(), "winrm");
    }

    #[tokio::test]
    async fn test_invalid_target_is_rejected() {
        let factory = DefaultConnectionFactory;
        let result = factory.create(&Target::new("w", TransportKind::Winrm)).await;
        assert!(matches!(result, Err(ExecError::Validation(_))));
    }
}
