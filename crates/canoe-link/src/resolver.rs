//! Namespace fallback: find a variable when its namespace is not known up front.

use crate::error::{LinkError, Result};
use crate::remote::{find_namespace_path, namespace_segments};
use crate::session::Session;
use crate::variable::VariableHandle;

/// Outcome of a lookup. A miss is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(VariableHandle),
    /// No candidate namespace held the variable. `tried` is the search order used.
    NotFound { tried: Vec<String> },
}

impl Resolution {
    pub fn found(self) -> Option<VariableHandle> {
        match self {
            Resolution::Found(handle) => Some(handle),
            Resolution::NotFound { .. } => None,
        }
    }

    /// Turn a miss into [`LinkError::VariableNotFound`].
    pub fn or_not_found(self, name: &str) -> Result<VariableHandle> {
        match self {
            Resolution::Found(handle) => Ok(handle),
            Resolution::NotFound { tried } => Err(LinkError::VariableNotFound {
                name: name.to_string(),
                tried,
            }),
        }
    }
}

impl Session {
    /// Search `candidates` in order and bind the first namespace that holds `name`.
    ///
    /// A missing namespace and a missing variable are both skipped, as is any
    /// lookup the application rejects. The first hit wins even if later
    /// candidates also contain the name. Only a broken link aborts the search.
    pub fn resolve<S: AsRef<str>>(&mut self, name: &str, candidates: &[S]) -> Result<Resolution> {
        let link = self.ensure_connected()?;
        let generation = link.info.generation;
        let mut tried = Vec::with_capacity(candidates.len());

        let lookup_failed = |err: crate::error::RemoteError| {
            LinkError::from_remote(err, "variable lookup", |reason| LinkError::ReadFailure {
                variable: name.to_string(),
                reason,
            })
        };

        for candidate in candidates {
            let candidate = candidate.as_ref();
            tried.push(candidate.to_string());

            let namespace = match find_namespace_path(link.app.as_mut(), candidate) {
                Ok(Some(namespace)) => namespace,
                Ok(None) => {
                    tracing::debug!(namespace = candidate, "namespace not present, skipping");
                    continue;
                }
                Err(err) if err.is_link_lost() => return Err(self.lose_link(&err)),
                Err(err) if err.is_transport() => return Err(lookup_failed(err)),
                Err(err) => {
                    tracing::debug!(namespace = candidate, "namespace lookup rejected: {err}");
                    continue;
                }
            };

            match link.app.find_variable(namespace, name) {
                Ok(Some(object)) => {
                    tracing::debug!(namespace = candidate, variable = name, "resolved");
                    let path = namespace_segments(candidate).collect::<Vec<_>>().join("::");
                    return Ok(Resolution::Found(VariableHandle::new(
                        path, name, object, generation,
                    )));
                }
                Ok(None) => {
                    tracing::debug!(namespace = candidate, variable = name, "not in namespace");
                }
                Err(err) if err.is_link_lost() => return Err(self.lose_link(&err)),
                Err(err) if err.is_transport() => return Err(lookup_failed(err)),
                Err(err) => {
                    tracing::debug!(namespace = candidate, variable = name, "variable lookup rejected: {err}");
                }
            }
        }

        Ok(Resolution::NotFound { tried })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedApplication;
    use pretty_assertions::assert_eq;

    fn session_with(sim: &SimulatedApplication) -> Session {
        let mut session = Session::new(sim.connector());
        session.connect().unwrap();
        session
    }

    #[test]
    fn test_first_candidate_wins() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Speed", 10.0);
        sim.add_variable("Measurement", "Speed", 20.0);
        let mut session = session_with(&sim);

        let handle = session
            .resolve("Speed", &["General", "Measurement"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(handle.namespace(), "General");

        let handle = session
            .resolve("Speed", &["Measurement", "General"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(handle.namespace(), "Measurement");
    }

    #[test]
    fn test_stops_at_first_match() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Speed", 10.0);
        sim.add_variable("Measurement", "Speed", 20.0);
        let mut session = session_with(&sim);

        sim.clear_calls();
        session.resolve("Speed", &["General", "Measurement"]).unwrap();
        assert!(sim.calls().iter().all(|call| !call.contains("Measurement")));
    }

    #[test]
    fn test_missing_namespace_is_skipped() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Measurement", "Temperature", 30.0);
        let mut session = session_with(&sim);

        let handle = session
            .resolve("Temperature", &["Absent", "Measurement"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(handle.qualified_name(), "Measurement::Temperature");
    }

    #[test]
    fn test_rejected_lookup_is_skipped() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Measurement", "Temperature", 30.0);
        sim.reject_namespace_lookup("General");
        let mut session = session_with(&sim);

        let resolution = session
            .resolve("Temperature", &["General", "Measurement"])
            .unwrap();
        assert!(matches!(resolution, Resolution::Found(_)));
    }

    #[test]
    fn test_nested_candidate_path() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Vehicle::Powertrain", "Rpm", 900.0);
        let mut session = session_with(&sim);

        let handle = session
            .resolve("Rpm", &["Vehicle", "Vehicle::Powertrain"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(handle.namespace(), "Vehicle::Powertrain");
    }

    #[test]
    fn test_not_found_reports_search_order() {
        let sim = SimulatedApplication::new();
        sim.add_namespace("General");
        let mut session = session_with(&sim);

        let resolution = session.resolve("Ghost", &["General", "B"]).unwrap();
        assert_eq!(
            resolution,
            Resolution::NotFound {
                tried: vec!["General".to_string(), "B".to_string()]
            }
        );

        let err = session
            .resolve("Ghost", &["General"])
            .unwrap()
            .or_not_found("Ghost")
            .unwrap_err();
        assert!(matches!(err, LinkError::VariableNotFound { .. }));
    }

    #[test]
    fn test_spaced_candidate_is_normalized() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Vehicle::Powertrain", "Rpm", 900.0);
        let mut session = session_with(&sim);

        let resolved = session
            .resolve("Rpm", &["Vehicle :: Powertrain"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(resolved.qualified_name(), "Vehicle::Powertrain::Rpm");

        let ensured = session
            .ensure_variable("Vehicle :: Powertrain", "Rpm", 0.0)
            .unwrap();
        assert_eq!(ensured.namespace(), resolved.namespace());
    }

    #[test]
    fn test_lost_link_aborts_search() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Measurement", "Temperature", 30.0);
        let mut session = session_with(&sim);

        sim.break_link();
        let err = session
            .resolve("Temperature", &["General", "Measurement"])
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        assert!(!session.is_connected());

        let handle = session
            .resolve("Temperature", &["General", "Measurement"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(handle.generation(), 2);
    }

    #[test]
    fn test_empty_candidate_list() {
        let sim = SimulatedApplication::new();
        let mut session = session_with(&sim);
        let empty: [&str; 0] = [];
        assert_eq!(
            session.resolve("Anything", &empty).unwrap(),
            Resolution::NotFound { tried: vec![] }
        );
    }
}
