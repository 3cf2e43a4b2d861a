//! Queue identity parsing, naming, and durability.


use gantry::types::QueueId;

#[gantry::test]
fn bare_names_are_static_and_durable() {
    let q = QueueId::parse("orders").expect("parses");
    assert_eq!(
        q,
        QueueId::Static {
            name: "orders".to_string()
        }
    );
    assert_eq!(q.name(), "orders");
    assert!(q.durable());
}

#[gantry::test]
fn consumer_queues_carry_the_durability_flag() {
    let ephemeral = QueueId::parse("consumer:c1").expect("parses");
    assert_eq!(
        ephemeral,
        QueueId::Consumer {
            consumer_id: "c1".to_string(),
            durable: false,
        }
    );
    assert!(!ephemeral.durable());

    let durable = QueueId::parse("consumer:c1:durable").expect("parses");
    assert_eq!(
        durable,
        QueueId::Consumer {
            consumer_id: "c1".to_string(),
            durable: true,
        }
    );
    assert!(durable.durable());
}

#[gantry::test]
fn fanout_and_prefixed_names_split_on_the_first_colon() {
    assert_eq!(
        QueueId::parse("fanout:events"),
        Some(QueueId::Fanout {
            topic: "events".to_string()
        })
    );
    assert_eq!(
        QueueId::parse("billing:invoices:eu"),
        Some(QueueId::Prefixed {
            prefix: "billing".to_string(),
            name: "invoices:eu".to_string(),
        })
    );
}

#[gantry::test]
fn names_round_trip_through_parse() {
    for name in [
        "orders",
        "consumer:c1",
        "consumer:c1:durable",
        "fanout:events",
        "billing:invoices",
    ] {
        let q = QueueId::parse(name).expect("parses");
        assert_eq!(q.name(), name);
        assert_eq!(QueueId::parse(&q.name()), Some(q));
    }
}

#[gantry::test]
fn malformed_names_parse_to_none() {
    for name in ["", "consumer:", "consumer::durable", "fanout:", ":orders", "billing:"] {
        assert_eq!(QueueId::parse(name), None, "{name:?} should not parse");
    }
}
