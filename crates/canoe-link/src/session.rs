//! Connection lifecycle: one `Session` owns one link to the application.

use crate::bridge::BridgeConnector;
use crate::config::LinkConfig;
use crate::error::{LinkError, RemoteError, Result};
use crate::remote::{Connector, RemoteApplication};

/// Stable states of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// What `connect()` learned about the attached application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub application: String,
    pub version: String,
    /// Incremented on every successful connect; handles carry the generation
    /// they were resolved under.
    pub generation: u64,
}

/// The live link. Exists only while the session is connected.
pub(crate) struct Link {
    pub(crate) app: Box<dyn RemoteApplication>,
    pub(crate) info: SessionInfo,
}

impl Link {
    /// Fails with a human-readable reason when a handle predates this link.
    pub(crate) fn check_generation(&self, generation: u64) -> std::result::Result<(), String> {
        if generation == self.info.generation {
            Ok(())
        } else {
            Err(format!(
                "stale handle from connection #{generation} (current #{}); resolve it again",
                self.info.generation
            ))
        }
    }
}

/// A logical connection to one CANoe instance.
///
/// All remote references are owned here and released on [`Session::disconnect`]
/// or drop. Variable and procedure handles are plain data and never keep the
/// link alive.
pub struct Session {
    connector: Box<dyn Connector>,
    link: Option<Link>,
    generation: u64,
    auto_connect: bool,
    /// Cleared by an explicit `disconnect()`, set again by `connect()`.
    auto_connect_armed: bool,
    candidates: Vec<String>,
}

impl Session {
    /// A session over any connector, with default settings.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_config(connector, &LinkConfig::default())
    }

    pub fn with_config(connector: impl Connector + 'static, config: &LinkConfig) -> Self {
        Self {
            connector: Box::new(connector),
            link: None,
            generation: 0,
            auto_connect: config.auto_connect,
            auto_connect_armed: config.auto_connect,
            candidates: config.namespace_candidates.clone(),
        }
    }

    /// A session that reaches CANoe through the COM bridge process.
    pub fn from_config(config: &LinkConfig) -> Self {
        Self::with_config(BridgeConnector::new(config.bridge.clone()), config)
    }

    /// Attach to the application. Already connected sessions return their current info.
    pub fn connect(&mut self) -> Result<SessionInfo> {
        self.auto_connect_armed = self.auto_connect;
        if let Some(link) = &self.link {
            return Ok(link.info.clone());
        }

        let mut app = self.connector.open().map_err(LinkError::Connect)?;

        let identity = match app.identity() {
            Ok(identity) => identity,
            Err(err) => {
                if let Err(release_err) = app.release() {
                    tracing::warn!("releasing half-open link failed: {release_err}");
                }
                return Err(LinkError::Connect(err));
            }
        };

        self.generation += 1;
        let info = SessionInfo {
            application: identity.name,
            version: identity.version,
            generation: self.generation,
        };
        tracing::info!(
            application = %info.application,
            version = %info.version,
            generation = info.generation,
            "connected"
        );

        self.link = Some(Link {
            app,
            info: info.clone(),
        });
        Ok(info)
    }

    /// Release every remote reference. Safe to call when already disconnected.
    ///
    /// Implicit reconnects stay disabled until the next explicit [`connect`](Self::connect).
    pub fn disconnect(&mut self) {
        self.auto_connect_armed = false;
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.app.release() {
                tracing::warn!("releasing CANoe link failed: {err}");
            }
            tracing::info!(generation = link.info.generation, "disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        if self.link.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.link.as_ref().map(|link| &link.info)
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Configured namespace search order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn set_candidates(&mut self, candidates: Vec<String>) {
        self.candidates = candidates;
    }

    /// The guard every remote operation goes through.
    pub(crate) fn ensure_connected(&mut self) -> Result<&mut Link> {
        if self.link.is_none() {
            if !self.auto_connect_armed {
                return Err(LinkError::NotConnected);
            }
            if let Err(err) = self.connect() {
                tracing::warn!("implicit connect failed: {err}");
                return Err(LinkError::NotConnected);
            }
        }
        self.link.as_mut().ok_or(LinkError::NotConnected)
    }

    /// The backend of the current link, without connecting.
    pub(crate) fn remote_app(&mut self) -> Option<&mut (dyn RemoteApplication + 'static)> {
        self.link.as_mut().map(|link| link.app.as_mut())
    }

    /// Drop a link that can no longer carry requests. The session is
    /// Disconnected afterwards; the guard reconnects on the next call if
    /// auto-connect is armed.
    pub(crate) fn lose_link(&mut self, err: &RemoteError) -> LinkError {
        if let Some(mut link) = self.link.take() {
            tracing::warn!(generation = link.info.generation, "link to CANoe lost: {err}");
            if let Err(release_err) = link.app.release() {
                tracing::debug!("releasing lost link failed: {release_err}");
            }
        }
        LinkError::NotConnected
    }

    /// Classify the outcome of a remote call. A lost link becomes `NotConnected`.
    pub(crate) fn settle<T>(
        &mut self,
        result: std::result::Result<T, RemoteError>,
        classify: impl FnOnce(RemoteError) -> LinkError,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_link_lost() => Err(self.lose_link(&err)),
            Err(err) => Err(classify(err)),
        }
    }

    pub fn measurement_running(&mut self) -> Result<bool> {
        let link = self.ensure_connected()?;
        let result = link.app.measurement_running();
        self.settle(result, |err| {
            LinkError::from_remote(err, "measurement status", LinkError::Measurement)
        })
    }

    pub fn start_measurement(&mut self) -> Result<()> {
        let link = self.ensure_connected()?;
        let result = link.app.start_measurement();
        self.settle(result, |err| {
            LinkError::from_remote(err, "measurement start", LinkError::Measurement)
        })?;
        tracing::info!("measurement started");
        Ok(())
    }

    pub fn stop_measurement(&mut self) -> Result<()> {
        let link = self.ensure_connected()?;
        let result = link.app.stop_measurement();
        self.settle(result, |err| {
            LinkError::from_remote(err, "measurement stop", LinkError::Measurement)
        })?;
        tracing::info!("measurement stopped");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.app.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedApplication;

    #[test]
    fn test_connect_and_disconnect() {
        let sim = SimulatedApplication::new();
        let mut session = Session::new(sim.connector());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let info = session.connect().unwrap();
        assert_eq!(info.generation, 1);
        assert_eq!(info.application, "CANoe");
        assert!(session.is_connected());

        // Connecting again is a no-op
        let again = session.connect().unwrap();
        assert_eq!(again, info);
        assert_eq!(sim.open_count(), 1);

        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(sim.is_released());

        // Idempotent
        session.disconnect();
        assert!(session.info().is_none());
    }

    #[test]
    fn test_failed_connect_stays_disconnected() {
        let sim = SimulatedApplication::new();
        sim.fail_connect("CANoe.Application is not registered");
        let mut session = Session::new(sim.connector());

        let err = session.connect().unwrap_err();
        assert!(matches!(err, LinkError::Connect(_)));
        assert!(err.to_string().contains("not registered"));
        assert!(!session.is_connected());
        assert_eq!(session.generation(), 0);
    }

    #[test]
    fn test_identity_failure_releases_root() {
        let sim = SimulatedApplication::new();
        sim.fail_identity("version object unavailable");
        let mut session = Session::new(sim.connector());

        assert!(matches!(session.connect(), Err(LinkError::Connect(_))));
        assert!(!session.is_connected());
        assert!(sim.is_released());
    }

    #[test]
    fn test_generation_increments_per_connect() {
        let sim = SimulatedApplication::new();
        let mut session = Session::new(sim.connector());
        session.connect().unwrap();
        session.disconnect();
        let info = session.connect().unwrap();
        assert_eq!(info.generation, 2);
        assert_eq!(session.generation(), 2);
    }

    #[test]
    fn test_guard_connects_lazily_once() {
        let sim = SimulatedApplication::new();
        let mut session = Session::new(sim.connector());

        assert!(!session.measurement_running().unwrap());
        assert!(session.is_connected());
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_guard_reports_not_connected_when_connect_fails() {
        let sim = SimulatedApplication::new();
        sim.fail_connect("not installed");
        let mut session = Session::new(sim.connector());

        assert!(matches!(
            session.measurement_running(),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_auto_connect_disabled() {
        let sim = SimulatedApplication::new();
        let config = LinkConfig {
            auto_connect: false,
            ..LinkConfig::default()
        };
        let mut session = Session::with_config(sim.connector(), &config);

        assert!(matches!(
            session.start_measurement(),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(sim.open_count(), 0);

        session.connect().unwrap();
        session.start_measurement().unwrap();
        assert!(session.measurement_running().unwrap());
        session.stop_measurement().unwrap();
        assert!(!session.measurement_running().unwrap());
    }

    #[test]
    fn test_lost_link_is_dropped_and_reopened() {
        let sim = SimulatedApplication::new();
        let mut session = Session::new(sim.connector());
        session.connect().unwrap();

        sim.break_link();
        assert!(matches!(
            session.measurement_running(),
            Err(LinkError::NotConnected)
        ));
        assert!(!session.is_connected());

        // The guard reconnects on the next call
        assert!(!session.measurement_running().unwrap());
        assert_eq!(sim.open_count(), 2);
        assert_eq!(session.generation(), 2);
    }

    #[test]
    fn test_lost_link_stays_down_without_auto_connect() {
        let sim = SimulatedApplication::new();
        let config = LinkConfig {
            auto_connect: false,
            ..LinkConfig::default()
        };
        let mut session = Session::with_config(sim.connector(), &config);
        session.connect().unwrap();

        sim.break_link();
        assert!(session.start_measurement().is_err());
        assert!(matches!(
            session.start_measurement(),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_drop_releases_link() {
        let sim = SimulatedApplication::new();
        {
            let mut session = Session::new(sim.connector());
            session.connect().unwrap();
        }
        assert!(sim.is_released());
    }
}
