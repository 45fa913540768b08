use super::{DomainEvent, EventBus};

fn created(habit_id: &str) -> DomainEvent {
    DomainEvent::HabitCreated {
        owner_id: "u1".to_string(),
        habit_id: habit_id.to_string(),
    }
}

#[test]
fn every_subscriber_receives_published_events_in_order() {
    let bus = EventBus::new();
    let first = bus.subscribe();
    let second = bus.subscribe();

    bus.publish(created("h1"));
    bus.publish(created("h2"));

    for rx in [first, second] {
        let names: Vec<_> = rx.try_iter().collect();
        assert_eq!(names, vec![created("h1"), created("h2")]);
    }
}

#[test]
fn dropped_subscribers_are_pruned_on_publish() {
    let bus = EventBus::new();
    let kept = bus.subscribe();
    drop(bus.subscribe());
    assert_eq!(bus.subscriber_count(), 2);

    bus.publish(created("h1"));

    assert_eq!(bus.subscriber_count(), 1);
    assert_eq!(kept.try_recv().expect("event should arrive"), created("h1"));
}

#[test]
fn names_match_legacy_refresh_topics() {
    assert_eq!(created("h1").name(), "habit_created");
    let value = serde_json::to_value(created("h1")).expect("event should serialize");
    assert_eq!(value["type"], "habit_created");
    assert_eq!(value["habit_id"], "h1");
}
