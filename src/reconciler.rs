use crate::classifier::TelemetryUpdate;
use crate::dedup::{half_cycle_key, Deduplicator};
use crate::models::{Device, Direction, NotificationRecord, NotificationType, SectionStatus};
use crate::notifier::{LowVoltageAlert, Notifier};
use crate::rest_store::{RestStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub low_voltage_threshold: f64,
    /// Wait before the separate-field resync after a successful combined PUT.
    pub fallback_delay: Duration,
    /// Spacing between the separate-field PUTs.
    pub fallback_spacing: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            low_voltage_threshold: 15.0,
            fallback_delay: Duration::from_millis(500),
            fallback_spacing: Duration::from_millis(200),
        }
    }
}

/// The device/section a message arrived for.
#[derive(Debug, Clone)]
pub struct ReconcileTarget {
    pub device_id: String,
    pub section_name: String,
    pub device_name: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
enum SingleField {
    Voltage(f64),
    Mode(String),
    Cycles(f64),
}

impl SingleField {
    fn name(&self) -> &'static str {
        match self {
            SingleField::Voltage(_) => "voltage",
            SingleField::Mode(_) => "mode",
            SingleField::Cycles(_) => "cycles",
        }
    }

    fn as_update(&self) -> TelemetryUpdate {
        match self {
            SingleField::Voltage(v) => TelemetryUpdate {
                voltage: Some(*v),
                ..TelemetryUpdate::default()
            },
            SingleField::Mode(m) => TelemetryUpdate {
                mode: Some(m.clone()),
                ..TelemetryUpdate::default()
            },
            SingleField::Cycles(c) => TelemetryUpdate {
                cycles: Some(*c),
                ..TelemetryUpdate::default()
            },
        }
    }
}

fn split_fields(update: &TelemetryUpdate) -> Vec<SingleField> {
    let mut fields = Vec::with_capacity(3);
    if let Some(voltage) = update.voltage {
        fields.push(SingleField::Voltage(voltage));
    }
    if let Some(mode) = &update.mode {
        fields.push(SingleField::Mode(mode.clone()));
    }
    if let Some(cycles) = update.cycles {
        fields.push(SingleField::Cycles(cycles));
    }
    fields
}

/// Writes only the supplied fields into the section; everything else keeps
/// its stored value.
pub fn merge_update(device: &mut Device, section_name: &str, update: &TelemetryUpdate) {
    let section = device.sections.entry(section_name.to_string()).or_default();
    if let Some(voltage) = update.voltage {
        section.voltage = Some(voltage);
    }
    if let Some(mode) = &update.mode {
        section.status = Some(SectionStatus::from(mode.clone()));
    }
    if let Some(cycles) = update.cycles {
        section.cycles = Some(cycles);
    }
}

/// Low-voltage context from the pre-update record, or from the message alone
/// when the record could not be loaded.
fn low_voltage_alert(target: &ReconcileTarget, before: Option<&Device>, voltage: f64) -> LowVoltageAlert {
    LowVoltageAlert {
        device_id: target.device_id.clone(),
        device_name: before
            .map(|device| device.display_name().to_string())
            .unwrap_or_else(|| target.device_name.clone()),
        section_name: target.section_name.clone(),
        project_id: before.and_then(|device| device.project_id.clone()),
        voltage,
        topic: target.topic.clone(),
    }
}

#[derive(Clone)]
pub struct TelemetryReconciler {
    store: Arc<RestStore>,
    notifier: Arc<Notifier>,
    dedup: Arc<Deduplicator>,
    settings: ReconcilerSettings,
}

impl TelemetryReconciler {
    pub fn new(
        store: Arc<RestStore>,
        notifier: Arc<Notifier>,
        dedup: Arc<Deduplicator>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            dedup,
            settings,
        }
    }

    /// Fetch fresh, merge, single PUT. The record as fetched (before the write)
    /// comes back on success, and alongside the error whenever the GET worked.
    async fn put_combined(
        &self,
        target: &ReconcileTarget,
        update: &TelemetryUpdate,
    ) -> Result<Device, (Option<Device>, StoreError)> {
        let before = self
            .store
            .fetch_device(&target.device_id)
            .await
            .map_err(|e| (None, e))?;
        let mut device = before.clone();
        merge_update(&mut device, &target.section_name, update);
        match self.store.put_device(&device).await {
            Ok(()) => Ok(before),
            Err(e) => Err((Some(before), e)),
        }
    }

    pub async fn apply_telemetry(&self, target: &ReconcileTarget, update: TelemetryUpdate) {
        if update.is_empty() {
            return;
        }

        let low_voltage = update
            .voltage
            .filter(|voltage| *voltage < self.settings.low_voltage_threshold);

        match self.put_combined(target, &update).await {
            Ok(before) => {
                info!(
                    "Telemetry for {}/{} stored: {:?}",
                    target.device_id, target.section_name, update
                );
                if let Some(voltage) = low_voltage {
                    let alert = low_voltage_alert(target, Some(&before), voltage);
                    self.notifier.send_low_voltage_alert(&alert).await;
                }

                let reconciler = self.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    sleep(reconciler.settings.fallback_delay).await;
                    reconciler.apply_fields_separately(&target, &update).await;
                });
            }
            Err((before, e)) => {
                warn!(
                    "Combined telemetry update for {}/{} failed: {}. Falling back to per-field updates.",
                    target.device_id, target.section_name, e
                );
                self.apply_fields_separately(target, &update).await;

                if let Some(voltage) = low_voltage {
                    let alert = low_voltage_alert(target, before.as_ref(), voltage);
                    self.notifier.send_low_voltage_alert(&alert).await;
                }
            }
        }
    }

    /// One PUT per supplied field, each against a freshly fetched record.
    /// Failures are logged only.
    pub async fn apply_fields_separately(&self, target: &ReconcileTarget, update: &TelemetryUpdate) {
        for (index, field) in split_fields(update).into_iter().enumerate() {
            if index > 0 {
                sleep(self.settings.fallback_spacing).await;
            }
            match self.put_combined(target, &field.as_update()).await {
                Ok(_) => debug!(
                    "Resynced {} for {}/{}.",
                    field.name(),
                    target.device_id,
                    target.section_name
                ),
                Err((_, e)) => error!(
                    "Per-field {} update for {}/{} failed: {}",
                    field.name(),
                    target.device_id,
                    target.section_name,
                    e
                ),
            }
        }
    }

    /// Adds half a cycle to the section's counter. Bursts inside the guard
    /// window collapse into one increment.
    pub async fn apply_half_cycle(&self, target: &ReconcileTarget) -> Option<f64> {
        let guard = half_cycle_key(&target.device_id, &target.section_name);
        if !self.dedup.admit_half_cycle(&guard).await {
            debug!("Half-cycle for {}/{} already being handled.", target.device_id, target.section_name);
            return None;
        }

        let mut device = match self.store.fetch_device(&target.device_id).await {
            Ok(device) => device,
            Err(e) => {
                error!("Half-cycle: could not load device {}: {}", target.device_id, e);
                return None;
            }
        };

        let section = device.sections.entry(target.section_name.clone()).or_default();
        let new_cycles = section.cycles.unwrap_or(0.0) + 0.5;
        section.cycles = Some(new_cycles);

        if let Err(e) = self.store.put_device(&device).await {
            error!("Half-cycle: could not store cycles for {}: {}", target.device_id, e);
            return None;
        }

        info!(
            "Half cycle finished for {}/{}; cycles now {}.",
            target.device_id, target.section_name, new_cycles
        );
        let message = format!("Half cycle finished. Cycles increased to {}", new_cycles);
        let record = NotificationRecord::new(&target.topic, &message, NotificationType::Info)
            .for_section(&target.device_id, device.display_name(), &target.section_name)
            .with_direction(Direction::Incoming);
        self.notifier.notify(record).await;

        Some(new_cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupWindows;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn settings() -> ReconcilerSettings {
        ReconcilerSettings {
            low_voltage_threshold: 15.0,
            fallback_delay: Duration::from_millis(10),
            fallback_spacing: Duration::from_millis(1),
        }
    }

    fn setup(server: &MockServer, windows: DedupWindows) -> TelemetryReconciler {
        let store = Arc::new(RestStore::new(&server.uri()));
        let dedup = Arc::new(Deduplicator::new(windows));
        let notifier = Arc::new(Notifier::new(store.clone(), dedup.clone(), 1000, true));
        TelemetryReconciler::new(store, notifier, dedup, settings())
    }

    fn target(device_id: &str) -> ReconcileTarget {
        ReconcileTarget {
            device_id: device_id.to_string(),
            section_name: "main".to_string(),
            device_name: "Solar-5".to_string(),
            topic: "r5/events".to_string(),
        }
    }

    fn device(id: &str, voltage: f64, cycles: f64) -> Value {
        json!({
            "id": id,
            "RobotName": "Solar-5",
            "projectId": "p1",
            "Sections": {
                "main": { "Voltage": voltage, "Cycles": cycles, "Status": "Idle", "mqttUrl": "h" },
                "car": { "Voltage": 30, "Cycles": 2 }
            }
        })
    }

    async fn accept_writes(server: &MockServer, device_id: &str) {
        Mock::given(method("PUT"))
            .and(path(format!("/robots/{}", device_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(server)
            .await;
        for route in ["/notifications", "/logs"] {
            Mock::given(method("POST"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
                .mount(server)
                .await;
        }
    }

    fn bodies(requests: &[Request], verb: &str, route: &str) -> Vec<Value> {
        requests
            .iter()
            .filter(|r| r.method.as_str() == verb && r.url.path() == route)
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    #[test]
    fn merge_leaves_unspecified_fields_alone() {
        let mut device: Device = serde_json::from_value(device("5", 24.0, 3.0)).unwrap();
        merge_update(
            &mut device,
            "main",
            &TelemetryUpdate {
                mode: Some("running".into()),
                ..TelemetryUpdate::default()
            },
        );
        let main = &device.sections["main"];
        assert_eq!(main.voltage, Some(24.0));
        assert_eq!(main.cycles, Some(3.0));
        assert_eq!(main.status, Some(SectionStatus::Running));
        assert_eq!(device.sections["car"].voltage, Some(30.0));
    }

    #[tokio::test]
    async fn low_voltage_update_is_stored_and_raises_danger_alert() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device("5", 24.0, 3.0)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1", "projectName": "Farm" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        accept_writes(&server, "5").await;

        let reconciler = setup(&server, DedupWindows::default());
        reconciler
            .apply_telemetry(
                &target("5"),
                TelemetryUpdate {
                    voltage: Some(12.0),
                    ..TelemetryUpdate::default()
                },
            )
            .await;
        sleep(Duration::from_millis(200)).await;

        let requests = server.received_requests().await.unwrap();
        let puts = bodies(&requests, "PUT", "/robots/5");
        // combined write plus the voltage-only resync
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0]["Sections"]["main"]["Voltage"], json!(12.0));
        assert_eq!(puts[0]["Sections"]["main"]["Cycles"], json!(3.0));
        assert_eq!(puts[0]["Sections"]["main"]["Status"], json!("Idle"));
        assert_eq!(puts[0]["Sections"]["car"]["Voltage"], json!(30.0));

        let notifications = bodies(&requests, "POST", "/notifications");
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0]["message"],
            json!("⚠️ Danger: Robot \"Solar-5\" voltage is critically low (12V)!")
        );
        assert!(bodies(&requests, "POST", "/logs").is_empty());
    }

    #[tokio::test]
    async fn failed_combined_put_falls_back_to_each_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots/6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device("6", 24.0, 3.0)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/robots/6"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/robots/6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .with_priority(2)
            .mount(&server)
            .await;

        let reconciler = setup(&server, DedupWindows::default());
        reconciler
            .apply_telemetry(
                &target("6"),
                TelemetryUpdate {
                    voltage: Some(22.0),
                    mode: Some("cleaning".into()),
                    cycles: Some(9.0),
                },
            )
            .await;

        let requests = server.received_requests().await.unwrap();
        let puts = bodies(&requests, "PUT", "/robots/6");
        assert_eq!(puts.len(), 4);
        // Each per-field write only changes its own field on top of the stored record.
        assert_eq!(puts[1]["Sections"]["main"]["Voltage"], json!(22.0));
        assert_eq!(puts[1]["Sections"]["main"]["Status"], json!("Idle"));
        assert_eq!(puts[2]["Sections"]["main"]["Status"], json!("cleaning"));
        assert_eq!(puts[2]["Sections"]["main"]["Voltage"], json!(24.0));
        assert_eq!(puts[3]["Sections"]["main"]["Cycles"], json!(9.0));
        assert!(bodies(&requests, "POST", "/notifications").is_empty());
    }

    #[tokio::test]
    async fn low_voltage_after_failed_put_still_emails_stakeholders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device("5", 24.0, 3.0)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1", "projectName": "Farm" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "name": "Ann", "email": "ann@example.com", "projectName": "Farm" },
                { "id": 2, "name": "Bob", "email": "bob@example.com", "projectName": "Orchard" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sendEmail"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/notifications"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .mount(&server)
            .await;

        let reconciler = setup(&server, DedupWindows::default());
        reconciler
            .apply_telemetry(
                &target("5"),
                TelemetryUpdate {
                    voltage: Some(12.0),
                    ..TelemetryUpdate::default()
                },
            )
            .await;

        let requests = server.received_requests().await.unwrap();
        // combined write plus the inline voltage-only retry, both rejected
        assert_eq!(bodies(&requests, "PUT", "/robots/5").len(), 2);

        let notifications = bodies(&requests, "POST", "/notifications");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["type"], json!("alert"));
        assert_eq!(
            notifications[0]["message"],
            json!("⚠️ Danger: Robot \"Solar-5\" voltage is critically low (12V)!")
        );
        assert!(bodies(&requests, "POST", "/logs").is_empty());

        let emails = bodies(&requests, "POST", "/sendEmail");
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0]["to"], json!("ann@example.com"));
    }

    #[tokio::test]
    async fn half_cycle_adds_half_and_guard_collapses_bursts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device("5", 24.0, 10.0)))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device("5", 24.0, 10.5)))
            .with_priority(2)
            .mount(&server)
            .await;
        accept_writes(&server, "5").await;

        let windows = DedupWindows {
            half_cycle_window: Duration::from_millis(100),
            ..DedupWindows::default()
        };
        let reconciler = setup(&server, windows);

        assert_eq!(reconciler.apply_half_cycle(&target("5")).await, Some(10.5));
        assert_eq!(reconciler.apply_half_cycle(&target("5")).await, None);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(reconciler.apply_half_cycle(&target("5")).await, Some(11.0));

        let requests = server.received_requests().await.unwrap();
        let puts = bodies(&requests, "PUT", "/robots/5");
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0]["Sections"]["main"]["Cycles"], json!(10.5));
        assert_eq!(puts[1]["Sections"]["main"]["Cycles"], json!(11.0));

        let notifications = bodies(&requests, "POST", "/notifications");
        assert_eq!(notifications[0]["message"], json!("Half cycle finished. Cycles increased to 10.5"));
        assert_eq!(notifications[1]["message"], json!("Half cycle finished. Cycles increased to 11"));
    }
}
