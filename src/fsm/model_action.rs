use super::action::{Action, ActionCall};
use super::engine::Continuation;
use super::trail::TrailRecord;
use crate::model::{ModelError, PromptMessage, PromptRole};
use crate::schema::{render_schema_reference, render_transition_schemas};
use serde_json::Value;
use std::sync::mpsc;
use std::thread;

/// Action name under which [`ModelAction`] is registered.
pub const MODEL_ACTION: &str = "llm";

/// Asks the configured model for the next document. The request runs on its
/// own thread so an interrupt can abandon it without waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelAction;

/// Assembles the conversation for one model call, in order: contract, state
/// prompts, trail projection, the input document if the trail does not
/// already end with it, then one exchange per rejected attempt. Hats listed
/// on the state decorate the result last.
pub fn build_prompt(call: &ActionCall<'_>) -> Vec<PromptMessage> {
    let definition = call.definition;
    let state = call.state;
    let outgoing = definition.outgoing(state.id.as_str()).map(|transition| {
        (
            transition.from_state().as_str(),
            transition.to_state().as_str(),
            &transition.schema,
        )
    });

    let mut contract = format!(
        "You are the `{}` state of the `{}` state machine. Reply with exactly one JSON \
         object. Its `id` field must name one of the allowed transitions as [from, to], \
         and the object must satisfy that transition's schema.\n\nAllowed transitions:\n{}",
        state.id,
        definition.id,
        render_transition_schemas(outgoing)
    );
    if !definition.schemas.is_empty() {
        contract.push_str("\n\nReferenced schemas:\n");
        contract.push_str(&render_schema_reference(&definition.schemas));
    }

    let mut messages = vec![PromptMessage::system(contract)];
    messages.extend(state.prompts.iter().map(PromptMessage::system));

    let trail = super::trail::Trail::from_records(call.trail.to_vec());
    messages.extend(trail.project(definition));

    let already_in_trail = matches!(
        call.trail.last(),
        Some(TrailRecord::Success { event, .. }) if event == call.document
    );
    if !already_in_trail {
        messages.push(PromptMessage::user(call.document.to_string()));
    }

    for feedback in &call.context.feedback {
        let output = feedback.get("output").cloned().unwrap_or(Value::Null);
        let errors = feedback
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n- ")
            })
            .unwrap_or_default();
        let rendered = match output {
            Value::String(raw) => raw,
            other => other.to_string(),
        };
        messages.push(PromptMessage::new(PromptRole::Assistant, rendered));
        messages.push(PromptMessage::user(format!(
            "That reply was rejected:\n- {errors}\nReply again with a corrected JSON object."
        )));
    }

    for name in &state.hats {
        if let Some(hat) = call.context.hats.get(name) {
            hat.decorate(state, &mut messages);
        }
    }
    messages
}

impl Action for ModelAction {
    fn invoke(&self, call: ActionCall<'_>, continuation: Continuation) {
        let context = call.context.clone();
        let Some(client) = context.model.clone() else {
            continuation.fail(context, "no model client is configured");
            return;
        };
        let messages = build_prompt(&call);

        let (sender, receiver) = mpsc::channel::<Result<Value, ModelError>>();
        let cancel = sender.clone();
        let token = match context.interrupt.compose(move || {
            let _ = cancel.send(Err(ModelError::Interrupted));
        }) {
            Ok(token) => token,
            Err(_) => {
                continuation.resume(context, Value::Null);
                return;
            }
        };

        let spawned = thread::Builder::new()
            .name(format!("model-{}", call.state.id))
            .spawn(move || {
                let _ = sender.send(client.complete(&messages));
            });
        if let Err(err) = spawned {
            context.interrupt.release(token);
            continuation.fail(context, format!("failed to start model request: {err}"));
            return;
        }

        let received = receiver.recv();
        context.interrupt.release(token);
        match received {
            Ok(Ok(document)) => continuation.resume(context, document),
            Ok(Err(ModelError::Malformed { raw, reason })) => {
                context.log.warn(
                    "model.malformed",
                    &format!("state={} reason={reason}", call.state.id),
                );
                continuation.resume(context, Value::String(raw));
            }
            Ok(Err(ModelError::Interrupted)) => continuation.resume(context, Value::Null),
            Ok(Err(err)) => {
                context.log.error(
                    "model.request_failed",
                    &format!("state={} error={err}", call.state.id),
                );
                continuation.fail(context, err.to_string());
            }
            Err(_) => continuation.fail(context, "model request ended without a reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::fsm::action::ActionRegistry;
    use crate::fsm::context::{Context, Hat, HatRegistry};
    use crate::fsm::definition::{FsmDefinition, StateDef};
    use crate::schema::BasicSchemaValidator;
    use serde_json::json;
    use std::sync::Arc;

    struct Shout;

    impl Hat for Shout {
        fn decorate(&self, _state: &StateDef, messages: &mut Vec<PromptMessage>) {
            messages.push(PromptMessage::system("ANSWER LOUDLY"));
        }
    }

    fn definition() -> FsmDefinition {
        FsmDefinition::from_value(
            json!({
                "id": "chat",
                "schemas": {"answer": {"type": "object", "required": ["text"]}},
                "states": [
                    {"id": "start"},
                    {"id": "llm", "action": "llm", "prompts": ["Be terse."], "hats": ["shout"]},
                    {"id": "end"}
                ],
                "transitions": [
                    {"id": ["start", "llm"]},
                    {"id": ["llm", "end"], "schema": {"$ref": "answer"}}
                ]
            }),
            &BasicSchemaValidator,
        )
        .expect("definition")
    }

    #[test]
    fn prompt_orders_contract_prompts_trail_feedback_and_hats() {
        let definition = definition();
        let mut hats = HatRegistry::default();
        hats.register("shout", Arc::new(Shout));
        let mut context =
            Context::new(ActionRegistry::new(), EngineSettings::default()).with_hats(hats);
        context.feedback.push(json!({
            "request": {"id": ["start", "llm"]},
            "output": "not json",
            "errors": ["output must declare `id: [from, to]`"]
        }));
        let document = json!({"id": ["start", "llm"], "question": "why?"});
        let trail = vec![TrailRecord::Success {
            from: crate::shared::ids::StateId::parse("start").expect("id"),
            to: crate::shared::ids::StateId::parse("llm").expect("id"),
            event: document.clone(),
        }];
        let call = ActionCall {
            context,
            definition: &definition,
            transition: &definition.transitions[0],
            state: definition.state("llm").expect("state"),
            trail: &trail,
            document: &document,
        };

        let messages = build_prompt(&call);
        let roles: Vec<PromptRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                PromptRole::System,
                PromptRole::System,
                PromptRole::User,
                PromptRole::Assistant,
                PromptRole::User,
                PromptRole::System,
            ]
        );
        assert!(messages[0].content.contains("[\"llm\",\"end\"]"));
        assert!(messages[0].content.contains("answer = "));
        assert_eq!(messages[1].content, "Be terse.");
        assert!(messages[2].content.contains("why?"));
        assert_eq!(messages[3].content, "not json");
        assert!(messages[4].content.contains("rejected"));
        assert_eq!(messages[5].content, "ANSWER LOUDLY");
    }
}
