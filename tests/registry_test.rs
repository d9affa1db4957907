//! Integration tests for the component registry.

use async_trait::async_trait;
use rust_eudaq::config::ProducerConfig;
use rust_eudaq::error::AppResult;
use rust_eudaq::event::Event;
use rust_eudaq::producer::{PollResult, Producer};
use rust_eudaq::registry::{str2hash, Registry, Role};
use rust_eudaq::DaqError;

struct Pulser {
    name: String,
}

#[async_trait]
impl Producer for Pulser {
    fn event_type(&self) -> &str {
        "PulserEvent"
    }

    async fn configure(&mut self, _config: &ProducerConfig) -> AppResult<()> {
        Ok(())
    }

    async fn begin_run(&mut self, _run_number: u32) -> AppResult<Event> {
        let mut bore = Event::new("PulserEvent");
        bore.set_tag("Instance", self.name.as_str());
        Ok(bore)
    }

    async fn poll(&mut self) -> PollResult {
        PollResult::NoEventYet
    }

    async fn end_run(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_create_returns_registered_type() {
    let mut registry = Registry::new();
    registry
        .register_producer("Pulser", |name| {
            Box::new(Pulser {
                name: name.to_string(),
            }) as Box<dyn Producer>
        })
        .unwrap();

    let mut producer = registry.create_producer("Pulser", "pulser1").unwrap();
    assert_eq!(producer.event_type(), "PulserEvent");
    let bore = producer.begin_run(1).await.unwrap();
    assert_eq!(bore.get_tag("Instance", ""), "pulser1");
}

#[test]
fn test_unregistered_name_fails() {
    let registry = Registry::builtin();
    match registry.create_producer("TLUProducer", "tlu") {
        Err(DaqError::UnregisteredComponent { hash, .. }) => {
            assert_eq!(hash, str2hash("TLUProducer"));
        }
        Err(other) => panic!("expected UnregisteredComponent, got {other}"),
        Ok(_) => panic!("expected UnregisteredComponent"),
    }
    assert!(matches!(
        registry.create_converter_by_hash(str2hash("NoSuchRawEvent")),
        Err(DaqError::UnregisteredComponent { .. })
    ));
}

#[test]
fn test_hash_collision_is_rejected() {
    assert_eq!(str2hash("costarring"), str2hash("liquid"));
    let mut registry = Registry::new();
    registry.register_event_type("costarring").unwrap();
    let err = registry.register_event_type("liquid").unwrap_err();
    assert!(matches!(err, DaqError::RegistryCollision { .. }));

    // The first registration stays in place
    assert_eq!(registry.event_type_name(str2hash("liquid")), Some("costarring"));
    assert!(registry.make_event("liquid").is_err());
}

#[test]
fn test_reregistering_a_name_replaces_it() {
    let mut registry = Registry::new();
    registry
        .register_producer("Pulser", |_| {
            Box::new(Pulser { name: "old".into() }) as Box<dyn Producer>
        })
        .unwrap();
    registry
        .register_producer("Pulser", |name| {
            Box::new(Pulser { name: format!("new-{name}") }) as Box<dyn Producer>
        })
        .unwrap();
    assert_eq!(registry.list(Role::Producer), vec!["Pulser".to_string()]);
}

#[test]
fn test_decode_event_by_type_tag() {
    let registry = Registry::builtin();
    let mut event = registry.make_event("CMSPixelDUT").unwrap();
    event.set_event_number(9);
    let decoded = registry.decode_event(&event.to_bytes()).unwrap();
    assert_eq!(decoded.event_number(), 9);
    assert_eq!(registry.event_type_name(decoded.type_id()), Some("CMSPixelDUT"));
}
