//! Line-oriented operator console.
//!
//! One command per line, arguments separated by `:`. Every line gets exactly
//! one reply: `OK`, `OK <json>` or `ERR <message>`.

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MqttUpdate;
use crate::controller::{Command, Reply, Request};
use crate::mqtt::parse_switch_payload;
use crate::schedule::RuleRecord;
use crate::{Error, Result};

pub const HELP: &str = "\
set:<ch>:<0|1>      switch one channel (1-8)
all:<0|1>           switch every channel
state               current outputs and status as JSON
rules               stored rule table as JSON
rules:<json>        replace the rule table ({\"rules\":[...]} or [...])
names:<json>        replace channel names ([\"Rose\",\"Mint\",...])
mqtt                broker settings as JSON (password omitted)
mqtt:<json>         replace broker settings ({\"mqttHost\":...})
help                this text";

/// What a console line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleAction {
    Run(Command),
    Help,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RulesPayload {
    Wrapped { rules: Vec<RuleRecord> },
    Bare(Vec<RuleRecord>),
}

fn switch_value(arg: Option<&str>) -> Result<bool> {
    let arg = arg.ok_or_else(|| Error::Parse("missing value, use 0 or 1".into()))?;
    parse_switch_payload(arg.as_bytes())
        .ok_or_else(|| Error::Parse(format!("invalid value '{arg}', use 0 or 1")))
}

fn json_arg<'a>(arg: Option<&'a str>, what: &str) -> Result<&'a str> {
    arg.filter(|a| !a.trim().is_empty())
        .ok_or_else(|| Error::Parse(format!("missing {what} JSON")))
}

/// Parses one line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ConsoleAction>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, arg) = match line.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (line, None),
    };

    let command = match name.trim() {
        "help" => return Ok(Some(ConsoleAction::Help)),
        "state" => Command::QueryState,
        "rules" => match arg {
            None => Command::QueryRules,
            Some(json) => {
                let json = json_arg(Some(json), "rules")?;
                let records = match serde_json::from_str::<RulesPayload>(json)? {
                    RulesPayload::Wrapped { rules } => rules,
                    RulesPayload::Bare(rules) => rules,
                };
                Command::ReplaceRules(records)
            }
        },
        "set" => {
            let mut parts = arg.unwrap_or_default().splitn(2, ':');
            let ch = parts
                .next()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| Error::Parse("missing channel".into()))?;
            let ch: u8 = ch
                .parse()
                .map_err(|_| Error::Parse(format!("invalid channel '{ch}'")))?;
            Command::SetChannel {
                ch,
                on: switch_value(parts.next())?,
            }
        }
        "all" => Command::SetChannel {
            ch: 0,
            on: switch_value(arg)?,
        },
        "names" => {
            let names: Vec<String> = serde_json::from_str(json_arg(arg, "names")?)?;
            Command::ReplaceNames(names)
        }
        "mqtt" if arg.is_none() => Command::QueryMqtt,
        "mqtt" => {
            let update: MqttUpdate = serde_json::from_str(json_arg(arg, "mqtt")?)?;
            Command::ReplaceMqtt(update)
        }
        other => return Err(Error::Parse(format!("unknown command: {other}"))),
    };
    Ok(Some(ConsoleAction::Run(command)))
}

/// Renders a command outcome as a reply line
pub fn format_reply(outcome: &Result<Reply>) -> String {
    let body = match outcome {
        Ok(Reply::Done) => return "OK".to_string(),
        Ok(Reply::State(state)) => serde_json::to_string(state),
        Ok(Reply::Rules(rules)) => serde_json::to_string(&serde_json::json!({ "rules": rules })),
        Ok(Reply::Mqtt(settings)) => serde_json::to_string(settings),
        Err(e) => return format!("ERR {e}"),
    };
    match body {
        Ok(json) => format!("OK {json}"),
        Err(e) => format!("ERR {e}"),
    }
}

/// Serves lines from `input` until it closes or the controller goes away
pub async fn run<R, W>(input: R, mut output: W, requests: mpsc::Sender<Request>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_line(&line) {
            Ok(None) => continue,
            Ok(Some(ConsoleAction::Help)) => HELP.to_string(),
            Ok(Some(ConsoleAction::Run(command))) => {
                debug!("Console command {:?}", command);
                let (request, rx) = Request::with_reply(command);
                if requests.send(request).await.is_err() {
                    break;
                }
                match rx.await {
                    Ok(outcome) => format_reply(&outcome),
                    Err(_) => format_reply(&Err(Error::General("controller stopped".into()))),
                }
            }
            Err(e) => format_reply(&Err(e)),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    info!("Console closed");
    Ok(())
}
