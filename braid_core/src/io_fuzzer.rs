use crate::config::{CoverageSettings, IoSettings};
use crate::coverage::{CoverageLog, CoverageSource, GrammarCoverage};
use crate::evaluation::Evaluator;
use crate::exchange::{ExchangeError, Message, Transport};
use crate::fuzz::{FuzzSettings, Fuzzer};
use crate::grammar::{Grammar, GrammarError};
use crate::packet::{GrammarReducer, PacketForecaster, PacketNavigator, PacketNonTerminal};
use crate::parser::ParsingMode;
use crate::power_schedule::PowerSchedule;
use crate::scheduler::{RandomScheduler, Scheduler};
use crate::selection::chance;
use crate::tree::DerivationTree;
use rand_core::RngCore;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Drives exchange rounds against a [`Transport`].
///
/// Messages of local parties are synthesized: the power schedule picks the
/// packet type to aim for, the navigator picks the eligible packet that
/// leads there soonest, and the best of several fuzzed candidates under the
/// evaluator is sent. Messages of remote parties are received and parsed
/// against the packets that may come next. A finished round is assembled
/// into one derivation tree of the whole exchange.
pub struct IoFuzzer {
    grammar: Grammar,
    settings: IoSettings,
    fuzz_settings: FuzzSettings,
    local_parties: BTreeSet<String>,
    forecaster: PacketForecaster,
    navigator: PacketNavigator,
    power: PowerSchedule<String>,
    fallback: Box<dyn Scheduler<String>>,
    coverage: Box<dyn CoverageSource>,
    log: CoverageLog,
    /// Every packet type produced so far, repeats included.
    observed: Vec<String>,
    rounds: usize,
}

impl IoFuzzer {
    /// # Arguments
    ///
    /// * `grammar` - A multi-party grammar whose start symbol describes a
    ///   whole exchange.
    /// * `settings` - Exchange settings; an empty `local_parties` plays
    ///   every sending party.
    /// * `coverage` - Coverage goal and sampling interval.
    /// * `fuzz_settings` - Size limits for synthesized messages.
    ///
    /// # Returns
    ///
    /// The fuzzer, or `GrammarError::UnknownParty` if a local party never
    /// appears in the grammar.
    pub fn new(
        grammar: &Grammar,
        settings: IoSettings,
        coverage: &CoverageSettings,
        fuzz_settings: FuzzSettings,
    ) -> Result<Self, ExchangeError> {
        let known = grammar.msg_parties(true);
        for party in &settings.local_parties {
            if !known.contains(party) {
                return Err(GrammarError::UnknownParty(party.clone(), known.into_iter().collect()).into());
            }
        }
        let local_parties: BTreeSet<String> = if settings.local_parties.is_empty() {
            grammar.msg_parties(false)
        } else {
            settings.local_parties.iter().cloned().collect()
        };
        let reduced = GrammarReducer::reduce(grammar)?;
        let local: Vec<String> = local_parties.iter().cloned().collect();
        Ok(Self {
            grammar: grammar.clone(),
            fuzz_settings,
            forecaster: PacketForecaster::new(reduced.clone()),
            navigator: PacketNavigator::new(reduced),
            power: PowerSchedule::new(),
            fallback: Box::new(RandomScheduler::new()),
            coverage: Box::new(GrammarCoverage::new(grammar, coverage.goal, &local)),
            log: CoverageLog::new(Duration::from_millis(coverage.log_interval_ms)),
            observed: Vec::new(),
            rounds: 0,
            local_parties,
            settings,
        })
    }

    /// Replaces the scheduler used when the power schedule has no usable
    /// energies.
    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler<String>>) -> Self {
        self.fallback = scheduler;
        self
    }

    /// Replaces the built-in grammar coverage, e.g. with an external signal.
    pub fn with_coverage(mut self, coverage: Box<dyn CoverageSource>) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn coverage(&self) -> f64 {
        self.coverage.coverage()
    }

    pub fn coverage_log(&self) -> &CoverageLog {
        &self.log
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn is_local(&self, packet: &PacketNonTerminal) -> bool {
        packet
            .sender
            .as_ref()
            .is_some_and(|s| self.local_parties.contains(s))
    }

    /// Runs one complete exchange.
    ///
    /// # Returns
    ///
    /// The derivation tree of the exchange, or the first exchange failure.
    /// A timeout fails this round only; the fuzzer stays usable.
    pub fn run_round(
        &mut self,
        transport: &mut dyn Transport,
        evaluator: &mut Evaluator,
        rng: &mut dyn RngCore,
    ) -> Result<DerivationTree, ExchangeError> {
        transport.reset()?;
        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let mut packets: Vec<PacketNonTerminal> = Vec::new();
        let mut history: Vec<(PacketNonTerminal, DerivationTree)> = Vec::new();

        loop {
            let candidates = self.forecaster.predict(&packets);
            if self.forecaster.is_complete(&packets)
                && (candidates.is_empty() || !chance(rng, self.settings.continue_probability))
            {
                break;
            }
            if history.len() >= self.settings.max_messages {
                return Err(ExchangeError::Truncated(history.len()));
            }
            if candidates.is_empty() {
                return Err(ExchangeError::Stuck(history.len()));
            }
            let (local, remote): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|p| self.is_local(p));
            let (packet, tree) = if local.is_empty() {
                let message = transport.receive(timeout)?;
                self.interpret(&remote, &message)?
            } else {
                let packet = self.pick_local(&local, rng)?;
                let tree = self.synthesize(&packet, evaluator, rng)?;
                transport.send(&Message {
                    sender: packet.sender.clone().unwrap_or_default(),
                    recipient: packet.recipient.clone(),
                    payload: tree.to_bytes(),
                })?;
                (packet, tree)
            };
            debug!(packet = %packet, "Exchanged message");
            packets.push(packet.clone());
            history.push((packet, tree));
        }

        let tree = self.forecaster.assemble(&history)?;
        self.coverage.observe(&tree);
        let coverage_by_type = self.coverage.coverage_by_type();
        for packet in &packets {
            self.observed.push(packet.name.clone());
            if self.is_local(packet) {
                self.fallback.report_feedback(&packet.name, &coverage_by_type);
            }
        }
        self.rounds += 1;
        let coverage = self.coverage.coverage();
        if self.log.sample(Instant::now(), coverage) {
            info!(round = self.rounds, coverage, "Exchange coverage");
        }
        Ok(tree)
    }

    /// Picks the local packet to produce next.
    fn pick_local(
        &mut self,
        local: &[PacketNonTerminal],
        rng: &mut dyn RngCore,
    ) -> Result<PacketNonTerminal, ExchangeError> {
        let coverage_by_type = self.coverage.coverage_by_type();
        let assigned = self
            .power
            .assign_energy(&self.observed, &coverage_by_type)
            .map(|energies| energies.len());
        let target = match assigned {
            Ok(_) => self.power.choose(rng).ok(),
            Err(e) => {
                debug!(error = %e, "No usable energies, deferring to the scheduler");
                None
            }
        };
        if let Some(target) = target {
            if let Some(packet) = local.iter().find(|p| p.name == target) {
                return Ok(packet.clone());
            }
            if let Some(packet) = self.closest_to(local, &target) {
                debug!(%target, via = %packet, "Steering towards packet type");
                return Ok(packet.clone());
            }
        }
        let names: Vec<String> = local.iter().map(|p| p.name.clone()).collect();
        let idx = self.fallback.next(&names, rng)?;
        Ok(local[idx].clone())
    }

    /// The candidate from which some packet of type `target` is cheapest
    /// to reach; ties go to the earlier candidate.
    fn closest_to<'a>(
        &self,
        candidates: &'a [PacketNonTerminal],
        target: &str,
    ) -> Option<&'a PacketNonTerminal> {
        let goals: Vec<&PacketNonTerminal> = self
            .forecaster
            .reduced()
            .packets()
            .iter()
            .filter(|p| p.name == target)
            .collect();
        candidates
            .iter()
            .filter_map(|candidate| {
                goals
                    .iter()
                    .filter_map(|goal| self.navigator.shortest_path(candidate, goal))
                    .map(|(_, cost)| cost)
                    .min()
                    .map(|cost| (cost, candidate))
            })
            .min_by_key(|(cost, _)| *cost)
            .map(|(_, candidate)| candidate)
    }

    /// Fuzzes several messages for `packet` and keeps the fittest.
    fn synthesize(
        &self,
        packet: &PacketNonTerminal,
        evaluator: &mut Evaluator,
        rng: &mut dyn RngCore,
    ) -> Result<DerivationTree, ExchangeError> {
        let fuzzer = Fuzzer::new(&self.grammar, self.fuzz_settings);
        let mut candidates = Vec::with_capacity(self.settings.candidates_per_packet);
        for _ in 0..self.settings.candidates_per_packet.max(1) {
            candidates.push(fuzzer.fuzz_symbol(&packet.name, self.fuzz_settings.max_nodes, rng)?);
        }
        let evaluations = evaluator.evaluate_population(&candidates);
        let mut best = 0;
        for (idx, evaluation) in evaluations.iter().enumerate() {
            if evaluation.fitness > evaluations[best].fitness {
                best = idx;
            }
        }
        Ok(candidates.swap_remove(best))
    }

    /// Matches a received message to one of the remote packets that may
    /// come next.
    fn interpret(
        &self,
        remote: &[PacketNonTerminal],
        message: &Message,
    ) -> Result<(PacketNonTerminal, DerivationTree), ExchangeError> {
        for packet in remote {
            if packet.sender.as_deref() != Some(message.sender.as_str()) {
                continue;
            }
            if let (Some(expected), Some(actual)) = (&packet.recipient, &message.recipient) {
                if expected != actual {
                    continue;
                }
            }
            if let Ok(tree) = self
                .grammar
                .parse(&message.payload, &packet.name, ParsingMode::Complete)
            {
                return Ok((packet.clone(), tree));
            }
        }
        Err(ExchangeError::UnexpectedMessage {
            sender: message.sender.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::InProcessEndpoint;
    use crate::grammar::GrammarBuilder;
    use crate::packet::tests::session_grammar;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn client_settings() -> IoSettings {
        IoSettings {
            local_parties: vec!["Client".to_string()],
            timeout_ms: 500,
            ..IoSettings::default()
        }
    }

    /// Acknowledges every DATA line and ignores everything else.
    fn server() -> InProcessEndpoint {
        InProcessEndpoint::new(|message: Message| {
            if message.payload.starts_with(b"DATA ") {
                Ok(vec![Message::new("Server", Some("Client"), "OK\n")])
            } else {
                Ok(Vec::new())
            }
        })
    }

    #[test]
    fn rounds_follow_the_protocol() {
        let grammar = session_grammar();
        let mut fuzzer = IoFuzzer::new(
            &grammar,
            client_settings(),
            &CoverageSettings::default(),
            FuzzSettings::default(),
        )
        .expect("fuzzer builds");
        let mut endpoint = server();
        let mut evaluator = Evaluator::new(Vec::new());
        let mut rng = ChaCha8Rng::from_seed([30; 32]);

        for _ in 0..5 {
            let tree = fuzzer
                .run_round(&mut endpoint, &mut evaluator, &mut rng)
                .expect("round completes");
            assert!(grammar.validate(&tree).is_ok(), "Exchange tree must be valid");
            let msgs = tree.protocol_msgs();
            assert_eq!(msgs.first().and_then(|m| m.symbol.name()), Some("hello"));
            assert_eq!(msgs.last().and_then(|m| m.symbol.name()), Some("bye"));
            let data = msgs.iter().filter(|m| m.symbol.name() == Some("data")).count();
            let acks = msgs.iter().filter(|m| m.sender == "Server").count();
            assert_eq!(data, acks, "Every DATA is acknowledged");
        }
        assert_eq!(fuzzer.rounds(), 5);
        assert!(fuzzer.coverage() > 0.0);
        assert!(!fuzzer.coverage_log().entries().is_empty());
    }

    /// `<start> ::= <C:S:req> <S:C:resp>`
    fn request_response() -> Grammar {
        let mut b = GrammarBuilder::new();
        let req = b.message("req", "C", Some("S"));
        let resp = b.message("resp", "S", Some("C"));
        let body = b.concat(vec![req, resp]);
        b.rule("start", body);
        let r = b.text("GET\n");
        b.rule("req", r);
        let ok = b.text("200\n");
        b.rule("resp", ok);
        b.build().expect("grammar builds")
    }

    fn client_of(grammar: &Grammar, timeout_ms: u64) -> IoFuzzer {
        let settings = IoSettings {
            local_parties: vec!["C".to_string()],
            timeout_ms,
            ..IoSettings::default()
        };
        IoFuzzer::new(grammar, settings, &CoverageSettings::default(), FuzzSettings::default())
            .expect("fuzzer builds")
    }

    #[test]
    fn silent_endpoint_times_out_without_breaking_the_fuzzer() {
        let grammar = request_response();
        let mut fuzzer = client_of(&grammar, 30);
        let mut silent = InProcessEndpoint::new(|_| Ok(Vec::new()));
        let mut evaluator = Evaluator::new(Vec::new());
        let mut rng = ChaCha8Rng::from_seed([31; 32]);
        let result = fuzzer.run_round(&mut silent, &mut evaluator, &mut rng);
        assert!(matches!(result, Err(ExchangeError::Timeout(_))), "Got {result:?}");

        let mut responsive =
            InProcessEndpoint::new(|_| Ok(vec![Message::new("S", Some("C"), "200\n")]));
        let tree = fuzzer
            .run_round(&mut responsive, &mut evaluator, &mut rng)
            .expect("next round succeeds");
        assert_eq!(tree.to_string(), "GET\n200\n");
    }

    #[test]
    fn garbage_reply_is_unexpected() {
        let grammar = request_response();
        let mut fuzzer = client_of(&grammar, 500);
        let mut endpoint = InProcessEndpoint::new(|_| Ok(vec![Message::new("S", Some("C"), "500\n")]));
        let mut evaluator = Evaluator::new(Vec::new());
        let mut rng = ChaCha8Rng::from_seed([32; 32]);
        let result = fuzzer.run_round(&mut endpoint, &mut evaluator, &mut rng);
        assert!(
            matches!(result, Err(ExchangeError::UnexpectedMessage { ref sender, .. }) if sender == "S"),
            "Got {result:?}"
        );
    }

    #[test]
    fn unknown_local_party_is_rejected() {
        let settings = IoSettings {
            local_parties: vec!["Mallory".to_string()],
            ..IoSettings::default()
        };
        let result = IoFuzzer::new(
            &request_response(),
            settings,
            &CoverageSettings::default(),
            FuzzSettings::default(),
        );
        assert!(matches!(
            result,
            Err(ExchangeError::Grammar(GrammarError::UnknownParty(ref party, _))) if party == "Mallory"
        ));
    }
}
