use braid_core::config::BraidConfig;
use braid_core::evolution::{Braid, EvolutionError, GenerationMode};
use braid_core::exchange::{ExchangeError, InProcessEndpoint, Message};
use braid_core::grammar::{Grammar, GrammarBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `<start> ::= <C:S:login> (<C:S:query> <S:C:answer>)+ <C:S:logout>`
fn service_grammar() -> Grammar {
    let mut b = GrammarBuilder::new();
    let login = b.message("login", "C", Some("S"));
    let query = b.message("query", "C", Some("S"));
    let answer = b.message("answer", "S", Some("C"));
    let turn = b.concat(vec![query, answer]);
    let turns = b.plus(turn);
    let logout = b.message("logout", "C", Some("S"));
    let body = b.concat(vec![login, turns, logout]);
    b.rule("start", body);
    let user = b.text("USER guest\n");
    b.rule("login", user);
    let get = b.text("GET ");
    let key = b.char_set("xyz".chars());
    let nl = b.text("\n");
    let query_body = b.concat(vec![get, key, nl]);
    b.rule("query", query_body);
    let found = b.text("FOUND\n");
    let missing = b.text("MISSING\n");
    let answer_body = b.alt(vec![found, missing]);
    b.rule("answer", answer_body);
    let bye = b.text("BYE\n");
    b.rule("logout", bye);
    b.build().expect("service grammar builds")
}

fn client_config() -> BraidConfig {
    let mut config = BraidConfig::default();
    config.evolution.seed = Some(5);
    config.io.local_parties = vec!["C".to_string()];
    config.io.timeout_ms = 1000;
    config
}

#[test]
fn every_item_is_one_complete_exchange() {
    let grammar = service_grammar();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&queries);
    let mut endpoint = InProcessEndpoint::new(move |message: Message| {
        if message.payload.starts_with(b"GET x") {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(vec![Message::new("S", Some("C"), "FOUND\n")])
        } else if message.payload.starts_with(b"GET ") {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(vec![Message::new("S", Some("C"), "MISSING\n")])
        } else {
            Ok(Vec::new())
        }
    });
    let mut braid = Braid::new(grammar.clone(), Vec::new(), &client_config()).expect("engine builds");

    let exchanges: Vec<_> = braid
        .generate(GenerationMode::Io(&mut endpoint))
        .take(4)
        .collect::<Result<_, EvolutionError>>()
        .expect("every round completes");

    let mut answered = 0;
    for tree in &exchanges {
        assert!(grammar.validate(tree).is_ok(), "Exchange must derive from the grammar");
        let msgs = tree.protocol_msgs();
        assert_eq!(msgs.first().map(|m| m.payload.as_slice()), Some(&b"USER guest\n"[..]));
        assert_eq!(msgs.last().map(|m| m.payload.as_slice()), Some(&b"BYE\n"[..]));
        for pair in msgs[1..msgs.len() - 1].chunks(2) {
            assert_eq!(pair[0].sender, "C");
            assert_eq!(pair[1].sender, "S");
            let expected: &[u8] = if pair[0].payload.starts_with(b"GET x") {
                b"FOUND\n"
            } else {
                b"MISSING\n"
            };
            assert_eq!(pair[1].payload, expected);
            answered += 1;
        }
    }
    assert_eq!(answered, queries.load(Ordering::Relaxed));
}

#[test]
fn hung_endpoint_fails_the_round_but_not_the_run() {
    let mut config = client_config();
    config.io.timeout_ms = 20;
    let mut silent = InProcessEndpoint::new(|_| Ok(Vec::new()));
    let mut braid = Braid::new(service_grammar(), Vec::new(), &config).expect("engine builds");
    let results: Vec<_> = braid.generate(GenerationMode::Io(&mut silent)).take(2).collect();
    assert_eq!(results.len(), 2, "The sequence continues after a timeout");
    for result in results {
        assert!(matches!(
            result,
            Err(EvolutionError::Exchange(ExchangeError::Timeout(_)))
        ));
    }
}
