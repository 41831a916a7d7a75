// SPDX-License-Identifier: MIT

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::{
    choose_exclusive, edge_holds, ensure_waiting, is_terminal, takes_input, variables_after,
    Recorder, RunEnv, RunFailure, RunReport, StageRecord,
};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{EdgeKind, FlowGraph, NodeDefinition, NodeKind, StagePlan};
use crate::parley::flow::nodes::{
    join_ready, ExternalInput, NodeOutcome, OutcomeStatus, Routing,
};
use crate::parley::flow::state::{Delta, ExecutionContext, SessionStatus};

/// Runs the flow as topological stages with concurrent members
///
/// Each stage is the set of activated, not-yet-executed nodes at the lowest
/// pending plan level whose joins are satisfied. Members run concurrently up
/// to the fan-out limit and their deltas are committed in completion order.
/// A join whose requirement is met while some of its sources are still
/// running is released into the current stage.
pub struct StagedRunner;

/// A stage member that returned
struct Finished<'g> {
    /// Position in the stage, for picking the suspension to keep
    index: usize,
    node: &'g NodeDefinition,
    outcome: Result<NodeOutcome, ParleyError>,
}

/// Execute one member against its own copy of the session state
fn execute_member<'f, 'g: 'f>(
    env: &'f RunEnv<'g>,
    index: usize,
    node: &'g NodeDefinition,
    state: ExecutionContext,
    input: Option<ExternalInput>,
) -> BoxFuture<'f, Finished<'g>> {
    async move {
        let cx = env.node_context(&state, input.as_ref());
        let outcome = env.registry.execute(node, &cx).await;
        Finished {
            index,
            node,
            outcome,
        }
    }
    .boxed()
}

/// Sources whose edges count towards a join
fn join_sources<'g>(graph: &'g FlowGraph, id: &str) -> Vec<&'g str> {
    graph
        .incoming(id)
        .filter(|e| !matches!(e.kind, EdgeKind::Error | EdgeKind::Timeout))
        .map(|e| e.source.as_str())
        .collect()
}

fn join_is_ready(graph: &FlowGraph, node: &NodeDefinition, state: &ExecutionContext) -> bool {
    match &node.kind {
        NodeKind::FanIn(cfg) => {
            join_ready(cfg, state.arrivals(&node.id), &join_sources(graph, &node.id))
        }
        _ => true,
    }
}

impl StagedRunner {
    pub async fn run(
        &self,
        env: &RunEnv<'_>,
        recorder: &mut Recorder<'_>,
        input: Option<&ExternalInput>,
    ) -> Result<RunReport, RunFailure> {
        let plan = env.graph.plan().ok_or_else(|| {
            ParleyError::Config(format!(
                "flow '{}' has no stage plan; set `strategy: staged` in its metadata",
                env.graph.id()
            ))
        })?;

        let mut report = RunReport::default();
        let mut input = input;

        while recorder.context().status() == SessionStatus::Running {
            if recorder.context().pending().is_empty() {
                log::info!("[{}] No pending nodes, completing", env.session_id);
                let mut delta = Delta::new(None);
                delta.set_status(SessionStatus::Completed);
                recorder.commit(delta).await?;
                break;
            }

            report.steps += 1;
            if report.steps > env.max_steps() {
                let at = recorder
                    .context()
                    .pending()
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_default();
                return Err(RunFailure::at(
                    &at,
                    ParleyError::routing(
                        &at,
                        format!("exceeded {} stages in one advance", env.max_steps()),
                    ),
                ));
            }

            let (level, members) = self.next_stage(env.graph, plan, recorder.context())?;
            let record = StageRecord {
                level,
                scheduled: members.iter().map(|n| n.id.clone()).collect(),
                completed: Vec::new(),
                deferred: Vec::new(),
            };
            log::info!(
                "[{}] Stage {} (level {}): {:?}",
                env.session_id,
                report.steps,
                level,
                record.scheduled
            );

            // the suspended node, or a fresh entry, consumes the input
            let receiver = members
                .iter()
                .find(|n| takes_input(recorder.context(), n))
                .map(|n| n.id.clone());
            let stage_input = match receiver {
                Some(id) => input.take().map(|i| (id, i.clone())),
                None => None,
            };

            let record = self
                .run_stage(env, recorder, members, stage_input, record)
                .await?;
            report.stages.push(record);
        }

        log::info!(
            "[{}] Staged run stopped in '{}' after {} stages",
            env.session_id,
            recorder.context().status(),
            report.steps
        );
        Ok(report)
    }

    /// Pending nodes at the lowest pending level whose joins are ready
    fn next_stage<'g>(
        &self,
        graph: &'g FlowGraph,
        plan: &StagePlan,
        state: &ExecutionContext,
    ) -> Result<(usize, Vec<&'g NodeDefinition>), ParleyError> {
        let level_of = |id: &str| {
            plan.level(id).ok_or_else(|| {
                ParleyError::routing(id, "node is not part of the stage plan")
            })
        };

        let mut lowest = usize::MAX;
        for id in state.pending() {
            lowest = lowest.min(level_of(id)?);
        }

        let mut members = Vec::new();
        let mut blocked = None;
        for id in plan.order() {
            if !state.pending().contains(id) || plan.level(id) != Some(lowest) {
                continue;
            }
            let node = graph
                .node(id)
                .ok_or_else(|| ParleyError::NodeNotFound(id.clone()))?;
            if join_is_ready(graph, node, state) {
                members.push(node);
            } else {
                blocked.get_or_insert(id.clone());
            }
        }

        // every predecessor sits on a lower level, so nothing else can arrive
        if members.is_empty() {
            let id = blocked.unwrap_or_default();
            return Err(ParleyError::routing(
                &id,
                "join requirement can no longer be met",
            ));
        }
        Ok((lowest, members))
    }

    /// Run the members of one stage, committing each result as it arrives
    async fn run_stage<'g>(
        &self,
        env: &RunEnv<'g>,
        recorder: &mut Recorder<'_>,
        members: Vec<&'g NodeDefinition>,
        mut stage_input: Option<(String, ExternalInput)>,
        mut record: StageRecord,
    ) -> Result<StageRecord, RunFailure> {
        let fan_out = env
            .services
            .config
            .fan_out_for(env.graph.metadata())
            .max(1);
        // one suspension per session: none if a node outside this stage
        // is already waiting for input
        let outside_wait = recorder
            .context()
            .awaiting()
            .is_some_and(|a| !record.scheduled.contains(&a.node_id));

        let mut queue: VecDeque<(usize, &'g NodeDefinition)> =
            members.into_iter().enumerate().collect();
        let mut next_index = queue.len();
        let mut running = FuturesUnordered::new();
        let mut unfinished: BTreeSet<String> = record.scheduled.clone();
        let mut suspended: Vec<(usize, &'g NodeDefinition, Delta)> = Vec::new();

        loop {
            while running.len() < fan_out {
                let Some((index, node)) = queue.pop_front() else {
                    break;
                };
                let receives = stage_input.as_ref().is_some_and(|(id, _)| *id == node.id);
                let node_input = if receives {
                    stage_input.take().map(|(_, i)| i)
                } else {
                    None
                };
                running.push(execute_member(
                    env,
                    index,
                    node,
                    recorder.context().clone(),
                    node_input,
                ));
            }

            let Some(Finished {
                index,
                node,
                outcome,
            }) = running.next().await
            else {
                break;
            };
            unfinished.remove(&node.id);

            let outcome = outcome.map_err(|e| RunFailure::at(&node.id, e))?;
            if outcome.status == OutcomeStatus::Waiting {
                suspended.push((index, node, outcome.delta));
                continue;
            }

            self.commit_member(env, recorder, node, outcome).await?;
            record.completed.push(node.id.clone());

            if recorder.context().status().is_terminal() {
                if !running.is_empty() || !queue.is_empty() {
                    log::debug!(
                        "[{}] Dropping {} unfinished members, session already {}",
                        env.session_id,
                        running.len() + queue.len(),
                        recorder.context().status()
                    );
                }
                return Ok(record);
            }

            for join in self.released_joins(env.graph, recorder.context(), &record, &unfinished) {
                log::info!(
                    "[{}] Releasing join '{}' before its remaining sources finish",
                    env.session_id,
                    join.id
                );
                record.scheduled.insert(join.id.clone());
                unfinished.insert(join.id.clone());
                queue.push_back((next_index, join));
                next_index += 1;
            }
        }

        // the first suspension in stage order is kept once the rest is in
        suspended.sort_by_key(|(index, _, _)| *index);
        let mut suspended = suspended.into_iter();
        let keep = if outside_wait { None } else { suspended.next() };
        for (_, node, _) in suspended {
            log::debug!("[{}] Deferring suspended '{}'", env.session_id, node.id);
            record.deferred.push(node.id.clone());
        }
        if let Some((_, node, mut delta)) = keep {
            if recorder.context().status() == SessionStatus::Running {
                ensure_waiting(&mut delta);
                log::info!("[{}] Suspended at '{}'", env.session_id, node.id);
                recorder.commit(delta).await?;
            }
        }
        Ok(record)
    }

    /// Route and commit a member that finished without suspending
    async fn commit_member(
        &self,
        env: &RunEnv<'_>,
        recorder: &mut Recorder<'_>,
        node: &NodeDefinition,
        outcome: NodeOutcome,
    ) -> Result<(), RunFailure> {
        let NodeOutcome {
            mut delta, routing, ..
        } = outcome;
        delta.mark_executed(&node.id);
        if !is_terminal(&delta) {
            let targets = self
                .activations(env, recorder.context(), node, &mut delta, routing)
                .map_err(|e| RunFailure::at(&node.id, e))?;
            for target in &targets {
                delta.activate(target, Some(&node.id));
            }
            if !delta.has_route() && !targets.is_empty() {
                delta.route(targets, None);
            }
        }
        recorder.commit(delta).await?;
        Ok(())
    }

    /// Pending joins outside the stage that are ready while some of their
    /// sources are still running
    fn released_joins<'g>(
        &self,
        graph: &'g FlowGraph,
        state: &ExecutionContext,
        record: &StageRecord,
        unfinished: &BTreeSet<String>,
    ) -> Vec<&'g NodeDefinition> {
        state
            .pending()
            .iter()
            .filter(|id| !record.scheduled.contains(*id))
            .filter_map(|id| graph.node(id))
            .filter(|node| matches!(node.kind, NodeKind::FanIn(_)))
            .filter(|node| {
                join_sources(graph, &node.id)
                    .iter()
                    .any(|s| unfinished.contains(*s))
            })
            .filter(|node| join_is_ready(graph, node, state))
            .collect()
    }

    /// Nodes a finished member activates
    fn activations(
        &self,
        env: &RunEnv<'_>,
        state: &ExecutionContext,
        node: &NodeDefinition,
        delta: &mut Delta,
        routing: Routing,
    ) -> Result<Vec<String>, ParleyError> {
        let graph = env.graph;
        let chosen: Vec<String> = match delta.route_targets() {
            Some(targets) => targets.to_vec(),
            None => match routing {
                Routing::Targets(targets) => targets,
                Routing::Label(label) => match graph.edge_by_label(&node.id, &label) {
                    Some(edge) => vec![edge.target.clone()],
                    None => {
                        return Err(ParleyError::routing(
                            &node.id,
                            format!("no edge labelled '{}'", label),
                        ))
                    }
                },
                Routing::Hold => Vec::new(),
                Routing::Advance => self.advance_targets(graph, state, node, delta)?,
            },
        };

        // one decision may not send a group to two members
        let mut decided: HashMap<String, &str> = HashMap::new();
        for target in &chosen {
            for group in graph.exclusive_groups(&node.id, target) {
                if let Some(previous) = decided.insert(group.clone(), target.as_str()) {
                    if previous != target.as_str() {
                        return Err(ParleyError::routing(
                            &node.id,
                            format!(
                                "exclusive group '{}' routed to both '{}' and '{}'",
                                group, previous, target
                            ),
                        ));
                    }
                }
            }
            choose_exclusive(graph, state, &node.id, target, delta)?;
        }
        Ok(chosen)
    }

    /// Targets for an `Advance`: plain and parallel edges, true conditional
    /// edges, and the first true member of each exclusive group
    fn advance_targets(
        &self,
        graph: &FlowGraph,
        state: &ExecutionContext,
        node: &NodeDefinition,
        delta: &Delta,
    ) -> Result<Vec<String>, ParleyError> {
        let vars = variables_after(state, delta);
        let mut targets: Vec<String> = graph
            .outgoing(&node.id)
            .filter(|e| e.is_plain_default() || e.kind == EdgeKind::Parallel)
            .map(|e| e.target.clone())
            .collect();

        let mut decided = BTreeSet::new();
        for edge in graph.guarded_edges(&node.id) {
            let group = edge.exclusive_group().filter(|_| edge.kind == EdgeKind::Exclusive);
            if let Some(group) = &group {
                if decided.contains(group) {
                    continue;
                }
            }
            if edge_holds(edge, &vars)? {
                if let Some(group) = group {
                    decided.insert(group);
                }
                targets.push(edge.target.clone());
            }
        }

        let mut seen = BTreeSet::new();
        targets.retain(|t| seen.insert(t.clone()));
        Ok(targets)
    }
}
