//! End-to-end dispatch of the bank-account commands through the gateway.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use command_bus::{
    AggregateHandler, CommandBus, CommandGateway, CommandHandler, Constraint,
    CorrelationInterceptor, Decision, DispatchError, ErrorHandler, ErrorKind, GatewayConfig,
    GatewayError, ValidationInterceptor,
};
use common::AggregateId;
use domain::account::{Account, Deposit, OpenAccount};
use domain::{CORRELATION_ID, Command};
use event_bus::{EventBus, FnListener};
use event_store::{EventEnvelope, EventStore, EventStoreExt, LogFileEventStore, Sequence};
use tokio::sync::Semaphore;

struct Harness {
    bus: Arc<CommandBus>,
    published: Arc<Mutex<Vec<EventEnvelope>>>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn EventStore> = Arc::new(LogFileEventStore::open(dir.path()).await.unwrap());
    let events = Arc::new(EventBus::new());
    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = published.clone();
    events.subscribe(Arc::new(FnListener::new("sink", move |e: &EventEnvelope| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    })));

    let bus = CommandBus::builder(store, events)
        .interceptor(
            ValidationInterceptor::new()
                .rule(OpenAccount::TYPE, "owner", Constraint::NotBlank)
                .rule(Deposit::TYPE, "amount", Constraint::Required)
                .rule(Deposit::TYPE, "amount", Constraint::Positive),
        )
        .interceptor(CorrelationInterceptor)
        .build();

    bus.subscribe(
        OpenAccount::TYPE,
        Arc::new(AggregateHandler::<Account>::new(|account, command| {
            let open: OpenAccount = command.payload_as()?;
            Ok(account.open(open.owner)?)
        })),
    );
    bus.subscribe(
        Deposit::TYPE,
        Arc::new(AggregateHandler::<Account>::existing(|account, command| {
            let deposit: Deposit = command.payload_as()?;
            Ok(account.deposit(deposit.amount)?)
        })),
    );

    Harness {
        bus: Arc::new(bus),
        published,
        _dir: dir,
    }
}

fn open(id: &str) -> Command {
    Command::new(OpenAccount::TYPE, "Account", id).with_field("owner", "bob")
}

fn deposit(id: &str, amount: i64) -> Command {
    Command::new(Deposit::TYPE, "Account", id).with_field("amount", amount)
}

#[tokio::test]
async fn open_then_deposit_then_stale_deposit() {
    let h = harness().await;
    let gateway = CommandGateway::start(h.bus.clone(), GatewayConfig::default());

    let opened = gateway.send(open("A1")).await.unwrap();
    assert_eq!(opened.events.len(), 1);
    assert_eq!(opened.events[0].event_type, "AccountOpened");
    assert_eq!(opened.events[0].aggregate_id, AggregateId::new("A1"));
    assert_eq!(opened.events[0].sequence, Sequence::new(0));
    assert!(opened.events[0].metadata.contains_key(CORRELATION_ID));

    let deposited = gateway
        .send(deposit("A1", 50).expecting(Sequence::new(0)))
        .await
        .unwrap();
    assert_eq!(deposited.events[0].event_type, "AmountDeposited");
    assert_eq!(deposited.events[0].sequence, Sequence::new(1));
    assert_eq!(deposited.events[0].payload["amount"], 50);

    let err = gateway
        .send(deposit("A1", 50).expecting(Sequence::new(0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
    assert!(err.is_retryable());

    let stream = h.bus.store().read_all(&AggregateId::new("A1")).await.unwrap();
    assert_eq!(stream.len(), 2);
    assert_eq!(*h.published.lock().unwrap(), stream);

    gateway.shutdown().await;
}

#[tokio::test]
async fn invalid_commands_leave_no_trace() {
    let h = harness().await;
    let gateway = CommandGateway::start(h.bus.clone(), GatewayConfig::default());

    let err = gateway
        .send(Command::new(OpenAccount::TYPE, "Account", "A1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Invalid);
    assert!(!err.is_retryable());

    let err = gateway.send(deposit("A1", 10)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    let err = gateway
        .send(Command::new("Close", "Account", "A1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unroutable);

    assert!(h.published.lock().unwrap().is_empty());
    assert!(!h.bus.store().aggregate_exists(&AggregateId::new("A1")).await.unwrap());

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_dispatches_have_one_winner() {
    let h = harness().await;
    h.bus.dispatch(open("A1")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let bus = h.bus.clone();
        tasks.push(tokio::spawn(async move {
            bus.dispatch(deposit("A1", 50).expecting(Sequence::new(0)))
                .await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(DispatchError::ConcurrencyConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((successes, conflicts), (1, 1));
    assert_eq!(
        h.bus.store().last_sequence(&AggregateId::new("A1")).await.unwrap(),
        Some(Sequence::new(1))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_for_one_aggregate_keep_submission_order() {
    let h = harness().await;
    let gateway = CommandGateway::start(
        h.bus.clone(),
        GatewayConfig {
            workers: 3,
            queue_capacity: 64,
        },
    );

    gateway.send_and_forget(open("A1"));
    for amount in 1..=20 {
        gateway.send_and_forget(deposit("A1", amount));
    }
    gateway.shutdown().await;

    let events = h.bus.store().read_all(&AggregateId::new("A1")).await.unwrap();
    let amounts: Vec<i64> = events[1..]
        .iter()
        .map(|e| e.payload["amount"].as_i64().unwrap())
        .collect();
    assert_eq!(amounts, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn fire_and_forget_failures_reach_the_error_handler() {
    let h = harness().await;
    let failures: Arc<Mutex<Vec<(String, ErrorKind)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let handler: ErrorHandler = Arc::new(move |command: &Command, err: &GatewayError| {
        sink.lock()
            .unwrap()
            .push((command.command_type.clone(), err.kind));
    });

    let gateway =
        CommandGateway::with_error_handler(h.bus.clone(), GatewayConfig::default(), handler);
    gateway.send_and_forget(deposit("A1", 10));
    gateway.shutdown().await;

    assert_eq!(
        *failures.lock().unwrap(),
        vec![("Deposit".to_string(), ErrorKind::NotFound)]
    );

    // After shutdown nothing is accepted.
    gateway.send_and_forget(open("A2"));
    assert_eq!(failures.lock().unwrap().len(), 2);
    assert_eq!(failures.lock().unwrap()[1].1, ErrorKind::Unavailable);
    assert_eq!(
        gateway.send(open("A2")).await.unwrap_err().kind,
        ErrorKind::Unavailable
    );
}

/// Waits for a permit before deciding, then opens the account.
struct Gated {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl CommandHandler for Gated {
    async fn decide(
        &self,
        store: &dyn EventStore,
        command: &Command,
    ) -> Result<Decision, DispatchError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| DispatchError::HandlerError(e.into()))?
            .forget();
        AggregateHandler::<Account>::new(|account, _| Ok(account.open("slow")?))
            .decide(store, command)
            .await
    }
}

#[tokio::test]
async fn full_queue_is_reported_as_unavailable() {
    let h = harness().await;
    let permits = Arc::new(Semaphore::new(0));
    h.bus.subscribe("SlowOpen", Arc::new(Gated { permits: permits.clone() }));

    let failures: Arc<Mutex<Vec<ErrorKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let gateway = CommandGateway::with_error_handler(
        h.bus.clone(),
        GatewayConfig {
            workers: 1,
            queue_capacity: 1,
        },
        Arc::new(move |_: &Command, err: &GatewayError| sink.lock().unwrap().push(err.kind)),
    );

    // The first command occupies the worker, the second fills the queue.
    gateway.send_and_forget(Command::new("SlowOpen", "Account", "A1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    gateway.send_and_forget(Command::new("SlowOpen", "Account", "A2"));
    gateway.send_and_forget(Command::new("SlowOpen", "Account", "A3"));

    assert_eq!(*failures.lock().unwrap(), vec![ErrorKind::Unavailable]);

    permits.add_permits(2);
    gateway.shutdown().await;
    assert!(h.bus.store().aggregate_exists(&AggregateId::new("A1")).await.unwrap());
    assert!(h.bus.store().aggregate_exists(&AggregateId::new("A2")).await.unwrap());
    assert!(!h.bus.store().aggregate_exists(&AggregateId::new("A3")).await.unwrap());
}

#[tokio::test]
async fn timed_out_send_still_commits() {
    let h = harness().await;
    let permits = Arc::new(Semaphore::new(0));
    h.bus.subscribe("SlowOpen", Arc::new(Gated { permits: permits.clone() }));
    let gateway = CommandGateway::start(h.bus.clone(), GatewayConfig::default());

    let err = gateway
        .send_with_timeout(
            Command::new("SlowOpen", "Account", "A1"),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(err.is_retryable());

    permits.add_permits(1);
    gateway.shutdown().await;
    assert_eq!(
        h.bus.store().last_sequence(&AggregateId::new("A1")).await.unwrap(),
        Some(Sequence::new(0))
    );
}

struct Explodes;

#[async_trait]
impl CommandHandler for Explodes {
    async fn decide(
        &self,
        _store: &dyn EventStore,
        _command: &Command,
    ) -> Result<Decision, DispatchError> {
        panic!("handler bug")
    }
}

fn single_worker() -> GatewayConfig {
    GatewayConfig {
        workers: 1,
        queue_capacity: 8,
    }
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_worker() {
    let h = harness().await;
    h.bus.subscribe("Explode", Arc::new(Explodes));
    let gateway = CommandGateway::start(h.bus.clone(), single_worker());

    let err = gateway
        .send(Command::new("Explode", "Account", "A1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert!(!err.is_retryable());
    assert!(err.message.contains("handler bug"));

    let outcome = gateway.send(open("A1")).await.unwrap();
    assert_eq!(outcome.last_sequence, Some(Sequence::first()));
    gateway.shutdown().await;
}

#[tokio::test]
async fn deposit_past_max_balance_is_rejected_and_account_stays_loadable() {
    let h = harness().await;
    let gateway = CommandGateway::start(h.bus.clone(), single_worker());

    gateway.send(open("A1")).await.unwrap();
    gateway.send(deposit("A1", i64::MAX)).await.unwrap();

    for _ in 0..2 {
        let err = gateway.send(deposit("A1", 1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);
    }
    assert!(gateway.send(open("B2")).await.is_ok());
    gateway.shutdown().await;

    assert_eq!(
        h.bus.store().last_sequence(&AggregateId::new("A1")).await.unwrap(),
        Some(Sequence::new(1))
    );
}

#[tokio::test]
async fn panicking_listener_does_not_fail_the_committed_command() {
    let h = harness().await;
    h.bus.events().subscribe(Arc::new(FnListener::new("fragile", |_: &EventEnvelope| {
        panic!("listener bug")
    })));
    let gateway = CommandGateway::start(h.bus.clone(), single_worker());

    let outcome = gateway.send(open("A1")).await.unwrap();
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(h.published.lock().unwrap().len(), 1);

    gateway.send(deposit("A1", 5)).await.unwrap();
    gateway.shutdown().await;
    assert_eq!(
        h.bus.store().last_sequence(&AggregateId::new("A1")).await.unwrap(),
        Some(Sequence::new(1))
    );
}
