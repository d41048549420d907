//! Scenario-scoped fixtures.
//!
//! A fixture is a named setup/teardown pair wrapping a cross-cutting
//! precondition (waiting for services to be healthy, configuring a
//! shared overlay zone). Fixtures are applied once per scenario by the
//! topology manager, not once per test.

use netbed_common::config::AppKind;
use netbed_common::Result;

use crate::manager::TopologyManager;

pub trait ServiceFixture: std::fmt::Debug {
    fn name(&self) -> &str;

    fn setup(&mut self, manager: &TopologyManager) -> Result<()>;

    fn teardown(&mut self, manager: &TopologyManager) -> Result<()>;
}

/// Blocks scenario start until every coordinator instance in the
/// topology reports ready. Teardown runs even when setup fails partway,
/// so callers can unconditionally re-raise the setup error.
#[derive(Debug)]
pub struct CoordinatorReadyFixture;

impl ServiceFixture for CoordinatorReadyFixture {
    fn name(&self) -> &str {
        "coordinator-ready"
    }

    fn setup(&mut self, manager: &TopologyManager) -> Result<()> {
        for host in manager.hosts_in_start_order() {
            for app in host.applications() {
                if app.kind() == AppKind::Coordinator {
                    tracing::debug!(
                        host = host.name(),
                        app = app.name(),
                        "fixture waiting for coordinator"
                    );
                    if let Err(e) = app.wait_for_start() {
                        let _ = self.teardown(manager);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self, _manager: &TopologyManager) -> Result<()> {
        Ok(())
    }
}
