//! Client and server testers talking over the loopback transport.

use std::rc::Rc;
use std::time::Duration;

use eanp::{
    BrokerConfig, BrokerRole, BrokerState, CommandStatus, Coordinator, DriverOutcome,
    LoopbackConfig, LoopbackNetwork, Message, ResultKind, Script, Tester, TransportError,
};

fn server(coordinator: &Coordinator, network: &LoopbackNetwork, config: BrokerConfig) -> Tester {
    Tester::setup(
        coordinator,
        BrokerRole::Server,
        Rc::new(network.server_transport()),
        config,
        None,
    )
    .expect("server setup")
}

fn client(coordinator: &Coordinator, network: &LoopbackNetwork, script: &Script) -> Tester {
    Tester::setup(
        coordinator,
        BrokerRole::Client,
        Rc::new(network.client_transport()),
        BrokerConfig::client(),
        Some(script),
    )
    .expect("client setup")
}

#[test]
fn test_sample_script_runs_to_completion() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let script = Script::sample();
    let server = server(&coordinator, &network, BrokerConfig::server());
    let client = client(&coordinator, &network, &script);

    coordinator.run_pending();

    assert_eq!(client.outcome(), Some(DriverOutcome::Drained));
    assert_eq!(client.driver().sent(), script.compile().expect("compiles"));
    assert!(
        client
            .driver()
            .reports()
            .iter()
            .all(|r| r.status == CommandStatus::Completed(ResultKind::Ok))
    );
    // One query and one reply per command.
    assert_eq!(network.frames_delivered(), 2 * script.len() as u64);
    assert_eq!(server.broker().channels().len(), 1);
}

#[test]
fn test_stop_client_closes_server_side_channel() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let server = server(&coordinator, &network, BrokerConfig::server());
    let client = client(&coordinator, &network, &Script::default());
    coordinator.run_pending();
    assert_eq!(server.broker().channels().len(), 1);

    assert!(client.shutdown());
    coordinator.run_pending();

    assert_eq!(client.broker().state(), BrokerState::Stopped);
    assert!(server.broker().is_running());
    assert!(server.broker().channels().is_empty());
    assert_eq!(network.open_links(), 0);
}

#[test]
fn test_stop_server_halts_client() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let server = server(&coordinator, &network, BrokerConfig::server());
    let client = client(&coordinator, &network, &Script::default());
    coordinator.run_pending();

    assert!(server.shutdown());
    coordinator.run_pending();

    // The client tester stops its halted broker from the close notification.
    assert_eq!(client.broker().state(), BrokerState::Stopped);
    assert_eq!(client.broker().halt_error(), None);
}

#[test]
fn test_no_server_refuses_connection() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let client = client(&coordinator, &network, &Script::sample());
    coordinator.run_pending();

    assert_eq!(client.broker().state(), BrokerState::Stopped);
    assert_eq!(
        client.broker().halt_error(),
        Some(TransportError::ConnectionRefused)
    );
    assert_eq!(client.outcome(), None);
    assert!(client.driver().sent().is_empty());
}

#[test]
fn test_server_channel_limit_turns_extra_clients_away() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let server = server(
        &coordinator,
        &network,
        BrokerConfig::server().with_max_channels(1),
    );
    let first = client(&coordinator, &network, &Script::sample());
    let second = client(&coordinator, &network, &Script::sample());
    coordinator.run_pending();

    assert_eq!(first.outcome(), Some(DriverOutcome::Drained));
    assert_eq!(second.broker().state(), BrokerState::Stopped);
    assert!(second.driver().sent().is_empty());
    assert_eq!(server.broker().channels().len(), 1);
}

#[test]
fn test_failure_results_from_a_custom_server() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let script = Script::sample();

    // A server that refuses everything instead of the default tester reply.
    let server = eanp::Broker::server(
        coordinator.clone(),
        Rc::new(network.server_transport()),
        BrokerConfig::server(),
    );
    server.on_channel_open(|channel| {
        channel.on_incoming_query(|query| {
            let refusal = eanp::ProtocolFailure::new(eanp::FailureKind::NotFound, "no such kws");
            query.reply(refusal.to_message()).expect("pending");
        });
    });
    server.start().expect("server start");
    let client = client(&coordinator, &network, &script);
    coordinator.run_pending();

    let reports = client.driver().reports();
    assert_eq!(reports.len(), script.len());
    assert!(reports.iter().all(|r| matches!(
        &r.status,
        CommandStatus::Failure(f) if f.message == "no such kws"
    )));
    assert_eq!(client.outcome(), Some(DriverOutcome::Drained));
}

#[test]
fn test_seeded_chaos_preserves_driver_invariants() {
    let script = Script::sample();
    let compiled = script.compile().expect("compiles");

    for seed in 0..200 {
        let coordinator = Coordinator::new();
        let network = LoopbackNetwork::new(LoopbackConfig::new(seed, 0.15));
        let _server = server(&coordinator, &network, BrokerConfig::server());
        let client = client(&coordinator, &network, &script);
        coordinator.run_pending();

        let sent = client.driver().sent();
        let reports = client.driver().reports();
        assert!(sent.len() <= compiled.len(), "seed {seed}");
        assert_eq!(sent[..], compiled[..sent.len()], "seed {seed}");
        assert_eq!(reports.len(), sent.len(), "seed {seed}");

        if network.faults_injected() == 0 {
            assert_eq!(client.outcome(), Some(DriverOutcome::Drained), "seed {seed}");
            assert_eq!(sent.len(), compiled.len(), "seed {seed}");
        } else {
            assert_eq!(
                client.outcome(),
                Some(DriverOutcome::Failed(TransportError::disconnected(
                    "injected fault"
                ))),
                "seed {seed}"
            );
            assert!(
                matches!(
                    reports.last().map(|r| &r.status),
                    Some(CommandStatus::Aborted(_))
                ),
                "seed {seed}"
            );
            assert_eq!(client.broker().state(), BrokerState::Stopped, "seed {seed}");
        }
    }
}

#[test]
fn test_same_seed_same_run() {
    let run = |seed| {
        let coordinator = Coordinator::new();
        let network = LoopbackNetwork::new(LoopbackConfig::chaotic(seed).with_fault_probability(0.3));
        let _server = server(&coordinator, &network, BrokerConfig::server());
        let client = client(&coordinator, &network, &Script::sample());
        coordinator.run_pending();
        (client.driver().sent().len(), network.faults_injected())
    };

    for seed in [1, 7, 42] {
        assert_eq!(run(seed), run(seed));
    }
}

#[tokio::test]
async fn test_run_until_with_completion_future() {
    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::reliable());
    let _server = server(&coordinator, &network, BrokerConfig::server());
    let client = client(&coordinator, &network, &Script::default());

    tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.run_until(|| client.is_finished()),
    )
    .await
    .expect("client reaches the server");

    let channel = client.broker().channels()[0].clone();
    let query = channel
        .send_query(Message::new(77).with("ping"))
        .expect("channel is open");
    let completion = query.completion();
    coordinator.run_pending();

    assert_eq!(
        completion.await,
        eanp::QueryOutcome::Success(ResultKind::Ok.message())
    );
}
