// SPDX-License-Identifier: MIT

use super::{
    choose_exclusive, ensure_waiting, is_terminal, label_of, takes_input, Recorder, RunEnv,
    RunFailure, RunReport,
};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::NodeDefinition;
use crate::parley::flow::nodes::{ExternalInput, NodeOutcome, OutcomeStatus, Routing};
use crate::parley::flow::state::{Delta, DeltaOp, SessionStatus};

/// One active node at a time
pub struct SequentialRunner;

/// Where a finished node sends the session
enum Next {
    Node(String),
    /// Nothing left to do
    Done,
}

impl SequentialRunner {
    pub async fn run(
        &self,
        env: &RunEnv<'_>,
        recorder: &mut Recorder<'_>,
        input: Option<&ExternalInput>,
    ) -> Result<RunReport, RunFailure> {
        let mut report = RunReport::default();
        let mut input = input;

        while recorder.context().status() == SessionStatus::Running {
            let node_id = recorder
                .context()
                .current_node()
                .map(str::to_string)
                .ok_or_else(|| ParleyError::Config("running session has no active node".into()))?;

            report.steps += 1;
            if report.steps > env.max_steps() {
                return Err(RunFailure::at(
                    &node_id,
                    ParleyError::routing(
                        &node_id,
                        format!("exceeded {} steps in one advance", env.max_steps()),
                    ),
                ));
            }

            let node = env.node(&node_id).map_err(|e| RunFailure::at(&node_id, e))?;
            let node_input = if takes_input(recorder.context(), node) {
                input.take()
            } else {
                None
            };

            let outcome = {
                let cx = env.node_context(recorder.context(), node_input);
                env.registry
                    .execute(node, &cx)
                    .await
                    .map_err(|e| RunFailure::at(&node_id, e))?
            };

            self.settle(env, recorder, node, outcome).await?;
        }

        log::info!(
            "[{}] Sequential run stopped in '{}' after {} steps",
            env.session_id,
            recorder.context().status(),
            report.steps
        );
        Ok(report)
    }

    /// Route and commit one node's outcome
    async fn settle(
        &self,
        env: &RunEnv<'_>,
        recorder: &mut Recorder<'_>,
        node: &NodeDefinition,
        outcome: NodeOutcome,
    ) -> Result<(), RunFailure> {
        let NodeOutcome {
            status,
            mut delta,
            routing,
        } = outcome;

        if status == OutcomeStatus::Waiting {
            ensure_waiting(&mut delta);
            log::info!("[{}] Suspended at '{}'", env.session_id, node.id);
            recorder.commit(delta).await?;
            return Ok(());
        }

        delta.mark_executed(&node.id);
        if is_terminal(&delta) {
            recorder.commit(delta).await?;
            return Ok(());
        }

        let next = self.next(env, node, &delta, routing).and_then(|next| {
            if let Next::Node(target) = &next {
                choose_exclusive(env.graph, recorder.context(), &node.id, target, &mut delta)?;
            }
            Ok(next)
        });
        match next {
            Ok(Next::Node(target)) => {
                if !delta.has_route() {
                    let label = label_of(env.graph, &node.id, &target);
                    delta.route(vec![target.clone()], label);
                }
                log::debug!("[{}] {} -> {}", env.session_id, node.id, target);
                recorder.commit(delta).await?;
                Ok(())
            }
            Ok(Next::Done) => {
                log::info!(
                    "[{}] '{}' has no outgoing edges, completing",
                    env.session_id,
                    node.id
                );
                delta.set_status(SessionStatus::Completed);
                recorder.commit(delta).await?;
                Ok(())
            }
            Err(error) => {
                // keep what the node did, minus the route it never took
                delta.ops.retain(|op| !matches!(op, DeltaOp::Route { .. }));
                recorder.commit(delta).await?;
                Err(RunFailure::at(&node.id, error))
            }
        }
    }

    fn next(
        &self,
        env: &RunEnv<'_>,
        node: &NodeDefinition,
        delta: &Delta,
        routing: Routing,
    ) -> Result<Next, ParleyError> {
        let targets: Vec<String> = match delta.route_targets() {
            // explicit routing is never overridden
            Some(targets) => targets.to_vec(),
            None => match routing {
                Routing::Advance => {
                    let defaults = env.graph.plain_default_edges(&node.id);
                    match defaults.as_slice() {
                        [edge] => vec![edge.target.clone()],
                        [] if env.graph.outgoing(&node.id).next().is_none() => {
                            return Ok(Next::Done)
                        }
                        [] => {
                            return Err(ParleyError::routing(
                                &node.id,
                                "cannot auto-advance: no unlabeled default edge",
                            ))
                        }
                        _ => {
                            return Err(ParleyError::routing(
                                &node.id,
                                "cannot auto-advance: default edge is ambiguous",
                            ))
                        }
                    }
                }
                Routing::Label(label) => match env.graph.edge_by_label(&node.id, &label) {
                    Some(edge) => vec![edge.target.clone()],
                    None => {
                        return Err(ParleyError::routing(
                            &node.id,
                            format!("no edge labelled '{}'", label),
                        ))
                    }
                },
                Routing::Targets(targets) => targets,
                Routing::Hold => {
                    return Err(ParleyError::routing(
                        &node.id,
                        "node held without suspending or terminating",
                    ))
                }
            },
        };

        let [target] = targets.as_slice() else {
            return Err(ParleyError::routing(
                &node.id,
                format!(
                    "{} targets {:?}; multi-target routing needs the staged strategy",
                    targets.len(),
                    targets
                ),
            ));
        };
        Ok(Next::Node(target.clone()))
    }
}
