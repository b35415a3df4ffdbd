//! Session instructions pushed by the remote operator over a data channel.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum InstructionKind {
    #[serde(rename = "0")]
    Started,
    #[serde(rename = "1")]
    NextStep,
    #[serde(rename = "2")]
    Finished,
    #[serde(rename = "3")]
    Aborted,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(rename = "type")]
    kind: InstructionKind,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Started,
    NextStep(StepInfo),
    Finished,
    Aborted,
}

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("malformed instruction: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("next step message without step data")]
    MissingStep,
}

/// Parses one text message. Step data is usually a JSON document encoded as
/// a string; an inline object is accepted too.
pub fn parse_instruction(text: &str) -> Result<Instruction, InstructionError> {
    let body: MessageBody = serde_json::from_str(text)?;
    Ok(match body.kind {
        InstructionKind::Started => Instruction::Started,
        InstructionKind::Finished => Instruction::Finished,
        InstructionKind::Aborted => Instruction::Aborted,
        InstructionKind::NextStep => {
            let step = match body.data {
                Some(Value::String(encoded)) => serde_json::from_str(&encoded)?,
                Some(Value::Null) | None => return Err(InstructionError::MissingStep),
                Some(inline) => serde_json::from_value(inline)?,
            };
            Instruction::NextStep(step)
        }
    })
}

pub fn present(instruction: &Instruction) {
    match instruction {
        Instruction::Started => tracing::info!("session started"),
        Instruction::NextStep(step) => {
            tracing::info!(step = %step.name, description = %step.description, "next step")
        }
        Instruction::Finished => tracing::info!("session completed"),
        Instruction::Aborted => tracing::warn!("session aborted"),
    }
}
