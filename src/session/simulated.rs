//! Simulated two-loop Peltier plate.
//!
//! Each loop's plate temperature relaxes towards
//! `ambient + gain * mv_own + coupling * gain * mv_other` with a first-order time
//! constant. The state is advanced lazily on every access using the elapsed time, so
//! the model runs at whatever rate it is polled.
//!
//! Node ids follow the plate server's layout, e.g.
//! `ns=2;s=0:PlacaTermica.Malha1?PlacaTermica.Malha1.PV`.

use super::{Connector, Session};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Endpoint scheme served by [`SimulatedConnector`].
pub const SIM_SCHEME: &str = "sim://";

/// Which variable of a loop a node refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlateVariable {
    /// Plate temperature, °C. Read-only.
    Pv,
    /// PWM command, %. Read/write.
    Mv,
}

/// Node id of `variable` on loop `index` (1-based, as on the plate server).
pub fn node_id(index: usize, variable: PlateVariable) -> String {
    let suffix = match variable {
        PlateVariable::Pv => "PV",
        PlateVariable::Mv => "MV",
    };
    format!("ns=2;s=0:PlacaTermica.Malha{index}?PlacaTermica.Malha{index}.{suffix}")
}

fn parse_node(node: &str) -> Option<(usize, PlateVariable)> {
    (1..=2).find_map(|index| {
        if node == node_id(index, PlateVariable::Pv) {
            Some((index - 1, PlateVariable::Pv))
        } else if node == node_id(index, PlateVariable::Mv) {
            Some((index - 1, PlateVariable::Mv))
        } else {
            None
        }
    })
}

/// Thermal parameters of the simulated plate.
#[derive(Clone, Debug)]
pub struct PlateModel {
    pub ambient: f64,
    /// Steady-state °C per % of PWM.
    pub gain: f64,
    /// Fraction of the other loop's heating felt by this loop.
    pub coupling: f64,
    pub time_constant: Duration,
}

impl Default for PlateModel {
    fn default() -> Self {
        Self {
            ambient: 25.0,
            gain: 0.45,
            coupling: 0.15,
            time_constant: Duration::from_secs(90),
        }
    }
}

struct PlateState {
    model: PlateModel,
    pv: [f64; 2],
    mv: [f64; 2],
    updated: Instant,
}

impl PlateState {
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.saturating_duration_since(self.updated).as_secs_f64();
        self.updated = now;
        let tau = self.model.time_constant.as_secs_f64().max(f64::EPSILON);
        let alpha = 1.0 - (-dt / tau).exp();
        for i in 0..2 {
            let other = self.mv[1 - i];
            let target = self.model.ambient
                + self.model.gain * (self.mv[i] + self.model.coupling * other);
            self.pv[i] += (target - self.pv[i]) * alpha;
        }
    }
}

/// Connector for `sim://` endpoints. All sessions share one plate.
#[derive(Clone)]
pub struct SimulatedConnector {
    plate: Arc<Mutex<PlateState>>,
}

impl SimulatedConnector {
    pub fn new(model: PlateModel) -> Self {
        let ambient = model.ambient;
        Self {
            plate: Arc::new(Mutex::new(PlateState {
                model,
                pv: [ambient; 2],
                mv: [0.0; 2],
                updated: Instant::now(),
            })),
        }
    }

    /// Current plate temperatures, for diagnostics.
    pub fn temperatures(&self) -> [f64; 2] {
        let mut plate = lock(&self.plate);
        plate.advance();
        plate.pv
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new(PlateModel::default())
    }
}

fn lock(plate: &Mutex<PlateState>) -> MutexGuard<'_, PlateState> {
    plate.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, endpoint: &str) -> AppResult<Box<dyn Session>> {
        if !endpoint.starts_with(SIM_SCHEME) {
            return Err(DaqError::Configuration(format!(
                "No protocol client available for '{endpoint}'; only {SIM_SCHEME} endpoints are served in-process"
            )));
        }
        tracing::info!(endpoint, "Connected to simulated plate");
        Ok(Box::new(SimulatedSession {
            plate: Arc::clone(&self.plate),
            connected: true,
        }))
    }
}

/// Session on the simulated plate.
pub struct SimulatedSession {
    plate: Arc<Mutex<PlateState>>,
    connected: bool,
}

impl SimulatedSession {
    fn plate(&self) -> AppResult<MutexGuard<'_, PlateState>> {
        if !self.connected {
            return Err(DaqError::Session("simulated session closed".to_string()));
        }
        let mut plate = lock(&self.plate);
        plate.advance();
        Ok(plate)
    }
}

#[async_trait]
impl Session for SimulatedSession {
    async fn read(&mut self, node: &str) -> AppResult<f64> {
        let (index, variable) =
            parse_node(node).ok_or_else(|| DaqError::channel(node, "unknown node"))?;
        let plate = self.plate()?;
        Ok(match variable {
            PlateVariable::Pv => plate.pv[index],
            PlateVariable::Mv => plate.mv[index],
        })
    }

    async fn write(&mut self, node: &str, value: f64) -> AppResult<()> {
        let (index, variable) =
            parse_node(node).ok_or_else(|| DaqError::channel(node, "unknown node"))?;
        if variable == PlateVariable::Pv {
            return Err(DaqError::channel(node, "node is read-only"));
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(DaqError::channel(
                node,
                format!("{value} is outside the 0-100 % range"),
            ));
        }
        self.plate()?.mv[index] = value;
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_round_trip() {
        let pv2 = node_id(2, PlateVariable::Pv);
        assert_eq!(pv2, "ns=2;s=0:PlacaTermica.Malha2?PlacaTermica.Malha2.PV");
        assert_eq!(parse_node(&pv2), Some((1, PlateVariable::Pv)));
        assert_eq!(parse_node("ns=2;s=0:Other.PV"), None);
    }

    #[tokio::test]
    async fn rejects_foreign_endpoints() {
        let connector = SimulatedConnector::default();
        let result = connector.connect("opc.tcp://localhost:48030").await;
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn plate_heats_towards_steady_state() {
        let connector = SimulatedConnector::default();
        let mut session = connector.connect("sim://placa").await.unwrap();
        let pv1 = node_id(1, PlateVariable::Pv);
        let mv1 = node_id(1, PlateVariable::Mv);

        assert_eq!(session.read(&pv1).await.unwrap(), 25.0);
        session.write(&mv1, 40.0).await.unwrap();
        assert_eq!(session.read(&mv1).await.unwrap(), 40.0);

        tokio::time::sleep(Duration::from_secs(900)).await;
        let steady = 25.0 + 0.45 * 40.0;
        assert!((session.read(&pv1).await.unwrap() - steady).abs() < 0.01);

        // Loop 2 only feels the coupled share.
        let pv2 = session.read(&node_id(2, PlateVariable::Pv)).await.unwrap();
        assert!((pv2 - (25.0 + 0.45 * 0.15 * 40.0)).abs() < 0.01);
    }

    #[tokio::test]
    async fn writes_are_validated() {
        let connector = SimulatedConnector::default();
        let mut session = connector.connect("sim://placa").await.unwrap();
        let mv1 = node_id(1, PlateVariable::Mv);

        assert!(session.write(&mv1, 120.0).await.is_err());
        assert!(session.write(&node_id(1, PlateVariable::Pv), 10.0).await.is_err());
        assert!(session.read("nope").await.is_err());

        session.disconnect().await.unwrap();
        assert!(session.read(&mv1).await.unwrap_err().is_session_level());
    }
}
