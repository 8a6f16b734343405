//! Routing of eval-set fields and target outputs into target and evaluator inputs.

use std::collections::BTreeMap;

use crate::llm::{ACTUAL_OUTPUT_FIELD, Message};
use crate::types::{
    Content, EvaluatorConf, EvaluatorInput, FieldAdapter, TargetIngressConf, TargetInput,
    TargetOutput, Turn,
};

pub fn turn_fields(turn: &Turn) -> BTreeMap<String, Content> {
    turn.field_data_list
        .iter()
        .map(|field| (field.name.clone(), field.content.clone()))
        .collect()
}

/// An empty adapter passes every source field through under its own name.
pub fn apply_field_adapter(
    adapter: &FieldAdapter,
    source: &BTreeMap<String, Content>,
) -> BTreeMap<String, Content> {
    if adapter.is_empty() {
        return source.clone();
    }
    adapter
        .field_confs
        .iter()
        .filter_map(|conf| {
            let content = match &conf.value {
                Some(value) => Content::text(value.clone()),
                None => source.get(&conf.from_field)?.clone(),
            };
            Some((conf.field_name.clone(), content))
        })
        .collect()
}

pub fn build_target_input(
    ingress: Option<&TargetIngressConf>,
    fields: &BTreeMap<String, Content>,
    history: &[Message],
) -> TargetInput {
    let Some(ingress) = ingress else {
        return TargetInput {
            fields: fields.clone(),
            history: history.to_vec(),
            ext: BTreeMap::new(),
        };
    };
    let ext = ingress
        .custom_conf
        .as_ref()
        .map(|custom| {
            apply_field_adapter(custom, fields)
                .into_iter()
                .map(|(name, content)| (name, content.as_text()))
                .collect()
        })
        .unwrap_or_default();
    TargetInput {
        fields: apply_field_adapter(&ingress.eval_set_adapter, fields),
        history: history.to_vec(),
        ext,
    }
}

pub fn build_evaluator_input(
    conf: Option<&EvaluatorConf>,
    fields: &BTreeMap<String, Content>,
    target_output: &TargetOutput,
    history: &[Message],
) -> EvaluatorInput {
    let ingress = conf.and_then(|conf| conf.ingress_conf.as_ref());
    let (input_fields, evaluate_target_output_fields) = match ingress {
        Some(ingress) => (
            apply_field_adapter(&ingress.eval_set_adapter, fields),
            apply_field_adapter(&ingress.target_adapter, &target_output.output_fields),
        ),
        None => (fields.clone(), target_output.output_fields.clone()),
    };
    EvaluatorInput {
        input_fields,
        evaluate_target_output_fields,
        history: history.to_vec(),
    }
}

/// Appends one finished turn to the conversation seen by later turns of the same item.
pub fn extend_history(history: &mut Vec<Message>, input: &TargetInput, output: &TargetOutput) {
    let user = input
        .fields
        .values()
        .map(Content::as_text)
        .collect::<Vec<_>>()
        .join("\n");
    history.push(Message::user(user));
    if let Some(reply) = output.output_fields.get(ACTUAL_OUTPUT_FIELD) {
        history.push(Message::assistant(reply.as_text()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::types::{EvaluatorIngressConf, FieldConf, FieldData};

    fn turn() -> Turn {
        Turn {
            id: 1,
            field_data_list: vec![
                FieldData {
                    key: "k1".to_string(),
                    name: "question".to_string(),
                    content: Content::text("2+2?"),
                },
                FieldData {
                    key: "k2".to_string(),
                    name: "answer".to_string(),
                    content: Content::text("4"),
                },
            ],
        }
    }

    fn conf(field_name: &str, from_field: &str, value: Option<&str>) -> FieldConf {
        FieldConf {
            field_name: field_name.to_string(),
            from_field: from_field.to_string(),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn test_adapter_renames_and_injects_literals() {
        let fields = turn_fields(&turn());
        let adapter = FieldAdapter {
            field_confs: vec![
                conf("input", "question", None),
                conf("lang", "", Some("en")),
                conf("missing", "nope", None),
            ],
        };
        let mapped = apply_field_adapter(&adapter, &fields);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped["input"].as_text(), "2+2?");
        assert_eq!(mapped["lang"].as_text(), "en");

        assert_eq!(apply_field_adapter(&FieldAdapter::default(), &fields), fields);
    }

    #[test]
    fn test_target_input_custom_conf_goes_to_ext() {
        let fields = turn_fields(&turn());
        let ingress = TargetIngressConf {
            eval_set_adapter: FieldAdapter {
                field_confs: vec![conf("input", "question", None)],
            },
            custom_conf: Some(FieldAdapter {
                field_confs: vec![conf("temperature", "", Some("0.2"))],
            }),
        };
        let input = build_target_input(Some(&ingress), &fields, &[]);
        assert_eq!(input.fields.keys().collect::<Vec<_>>(), vec!["input"]);
        assert_eq!(input.ext["temperature"], "0.2");
    }

    #[test]
    fn test_evaluator_input_and_history() {
        let fields = turn_fields(&turn());
        let mut output = TargetOutput::default();
        output
            .output_fields
            .insert(ACTUAL_OUTPUT_FIELD.to_string(), Content::text("four"));
        let conf = EvaluatorConf {
            evaluator_version_id: 7,
            ingress_conf: Some(EvaluatorIngressConf {
                eval_set_adapter: FieldAdapter {
                    field_confs: vec![conf("reference", "answer", None)],
                },
                target_adapter: FieldAdapter::default(),
            }),
        };
        let input = build_evaluator_input(Some(&conf), &fields, &output, &[]);
        assert_eq!(input.input_fields["reference"].as_text(), "4");
        assert_eq!(
            input.evaluate_target_output_fields[ACTUAL_OUTPUT_FIELD].as_text(),
            "four"
        );

        let mut history = Vec::new();
        let target_input = build_target_input(None, &fields, &history);
        extend_history(&mut history, &target_input, &output);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "four");
    }
}
