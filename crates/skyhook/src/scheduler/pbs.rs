use std::future::Future;
use std::pin::Pin;
use std::process::Output;
use std::time::SystemTime;

use anyhow::Context;
use bstr::ByteSlice;
use chrono::TimeZone;
use tokio::process::Command;

use crate::scheduler::state::parse_state_set;
use crate::scheduler::{
    AdapterResult, JobState, NodeInfo, Scheduler, SchedulerJob, SchedulerJobId,
};
use crate::Map;

/// qstat exits with this code when every queried job has already finished;
/// the query must be repeated with the historical (`-x`) flag.
const QSTAT_JOB_FINISHED: i32 = 35;
/// qstat exits with this code when at least one queried job id is unknown;
/// the error lines are stripped and the remaining output is still valid.
const QSTAT_UNKNOWN_JOB_ID: i32 = 153;

pub struct PbsScheduler;

impl PbsScheduler {
    pub fn new() -> Self {
        Self
    }

    async fn query_structured(
        ids: Vec<SchedulerJobId>,
        historical: bool,
    ) -> AdapterResult<Vec<SchedulerJob>> {
        // qstat without explicit ids lists the whole cluster.
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut arguments = vec!["qstat", "-f", "-F", "json"];
        if historical {
            arguments.push("-x");
        }
        arguments.extend(ids.iter().map(|id| id.as_str()));
        let output = run_command(&arguments).await?;

        match classify_qstat_output(&output)? {
            QstatDisposition::Parse(stdout) => parse_jobs_json(&stdout),
            QstatDisposition::QueryHistorical => {
                if historical {
                    // The historical query reported "finished" again; there
                    // is nothing further to widen the query with.
                    log::warn!("Historical qstat still reported finished jobs, returning no jobs");
                    Ok(Vec::new())
                } else {
                    Box::pin(Self::query_structured(ids, true)).await
                }
            }
            QstatDisposition::Empty => Ok(Vec::new()),
        }
    }
}

impl Default for PbsScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PbsScheduler {
    fn query_job_page(
        &self,
        ids: &[SchedulerJobId],
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
        let ids = ids.to_vec();
        Box::pin(Self::query_structured(ids, false))
    }

    fn jobs_for_owner(
        &self,
        owner: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
        let owner = owner.to_string();
        Box::pin(async move {
            let output = run_command(&["qstat", "-u", &owner]).await?;
            let rows = match classify_qstat_output(&output)? {
                QstatDisposition::Parse(stdout) => parse_owner_listing(&stdout),
                QstatDisposition::QueryHistorical | QstatDisposition::Empty => return Ok(Vec::new()),
            };

            // The columnar listing truncates job ids, so the rows are
            // re-resolved through the structured query and reconciled by
            // prefix for full fidelity.
            let ids: Vec<SchedulerJobId> = rows
                .iter()
                .map(|row| sequence_id(&row.job_id).to_string())
                .collect();
            let jobs = Self::query_structured(ids, false).await?;
            Ok(reconcile_truncated_ids(&rows, jobs))
        })
    }

    fn queue_jobs(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let output = run_command(&["qstat", "-f", "-F", "json", &queue]).await?;
            match classify_qstat_output(&output)? {
                QstatDisposition::Parse(stdout) => parse_jobs_json(&stdout),
                QstatDisposition::QueryHistorical | QstatDisposition::Empty => Ok(Vec::new()),
            }
        })
    }

    fn get_node(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Option<NodeInfo>>> + Send>> {
        let host = host.to_string();
        Box::pin(async move {
            let output = run_command(&["pbsnodes", &host, "-F", "json"]).await?;
            if !output.status.success() {
                let stderr = output.stderr.to_str_lossy();
                if stderr.contains("Unknown node") {
                    return Ok(None);
                }
                anyhow::bail!("pbsnodes failed: {}", stderr.trim());
            }
            let stdout = output.stdout.to_str_lossy();
            let mut nodes = parse_nodes_json(&stdout)?;
            Ok(nodes.pop())
        })
    }

    fn list_nodes(
        &self,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<NodeInfo>>> + Send>> {
        Box::pin(async move {
            let output = run_command(&["pbsnodes", "-a", "-F", "json"]).await?;
            if !output.status.success() {
                let stderr = output.stderr.to_str_lossy();
                // An empty cluster is not an error.
                if stderr.contains("No nodes") {
                    return Ok(Vec::new());
                }
                anyhow::bail!("pbsnodes failed: {}", stderr.trim());
            }
            parse_nodes_json(&output.stdout.to_str_lossy())
        })
    }

    fn create_node(
        &self,
        host: &str,
        attributes: Map<String, String>,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>> {
        let host = host.to_string();
        Box::pin(async move {
            let create = format!("create node {host}");
            let output = run_command(&["qmgr", "-c", &create]).await?;
            check_command_output(output).context("node creation failed")?;

            let mut attributes: Vec<(String, String)> = attributes.into_iter().collect();
            attributes.sort();
            for (key, value) in attributes {
                let set = format!("set node {host} {key} = {value}");
                let output = run_command(&["qmgr", "-c", &set]).await?;
                check_command_output(output)
                    .with_context(|| format!("setting node attribute {key} failed"))?;
            }
            Ok(())
        })
    }

    fn delete_node(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>> {
        let host = host.to_string();
        Box::pin(async move {
            let delete = format!("delete node {host}");
            let output = run_command(&["qmgr", "-c", &delete]).await?;
            check_command_output(output).context("node deletion failed")?;
            Ok(())
        })
    }
}

async fn run_command(arguments: &[&str]) -> AdapterResult<Output> {
    log::debug!("Running scheduler command `{}`", arguments.join(" "));
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command
        .output()
        .await
        .with_context(|| format!("{} start failed", arguments[0]))
}

fn check_command_output(output: Output) -> AdapterResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

enum QstatDisposition {
    /// Output is usable as-is (possibly after unknown-id line stripping).
    Parse(String),
    /// Every job already finished; repeat the query with the `-x` flag.
    QueryHistorical,
    /// The command was aborted; treated as an empty result.
    Empty,
}

/// Exit codes carry the primary failure semantics of qstat; stderr is only
/// consulted for the recovery paths.
fn classify_qstat_output(output: &Output) -> AdapterResult<QstatDisposition> {
    match output.status.code() {
        Some(0) => Ok(QstatDisposition::Parse(
            output.stdout.to_str_lossy().into_owned(),
        )),
        Some(QSTAT_JOB_FINISHED) => Ok(QstatDisposition::QueryHistorical),
        Some(QSTAT_UNKNOWN_JOB_ID) => Ok(QstatDisposition::Parse(strip_unknown_id_lines(
            &output.stdout.to_str_lossy(),
        ))),
        None => {
            log::warn!("qstat was terminated by a signal, treating the result as empty");
            Ok(QstatDisposition::Empty)
        }
        Some(code) => Err(anyhow::anyhow!(
            "qstat exited with {}: {}",
            code,
            output.stderr.to_str_lossy().trim()
        )),
    }
}

/// Drops the `qstat: Unknown Job Id ...` lines that qstat mixes into its
/// output when some of the queried ids no longer exist.
fn strip_unknown_id_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("qstat:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes the `Variable_List` environment block from qstat JSON output in a
/// single line scan. The block holds the submitter's full environment, can
/// be hundreds of kilobytes, and is never needed here; decoding is both
/// sturdier and faster without it.
fn strip_environment_blocks(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut strip_comma_before: Vec<usize> = Vec::new();
    let mut depth: i64 = 0;
    let mut in_block = false;

    for line in text.lines() {
        if !in_block {
            if line.trim_start().starts_with("\"Variable_List\"") {
                in_block = true;
                depth = brace_delta(line);
            } else {
                kept.push(line);
                continue;
            }
        } else {
            depth += brace_delta(line);
        }
        if in_block && depth <= 0 {
            in_block = false;
            // A block without a trailing comma was the last attribute; the
            // comma on the previous kept line must go too.
            if !line.trim_end().ends_with(',') {
                if let Some(index) = kept.len().checked_sub(1) {
                    strip_comma_before.push(index);
                }
            }
        }
    }

    let mut result = String::with_capacity(text.len());
    for (index, line) in kept.iter().enumerate() {
        if !result.is_empty() {
            result.push('\n');
        }
        if strip_comma_before.contains(&index) {
            result.push_str(line.trim_end().trim_end_matches(','));
        } else {
            result.push_str(line);
        }
    }
    result
}

/// Net brace nesting change of one line, ignoring braces inside JSON string
/// literals. Environment values routinely contain braces (shell prompts,
/// exported functions), so raw counting would close the block early. qstat
/// never splits a string literal across lines.
fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    let mut in_string = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_string => {
                chars.next();
            }
            '"' => in_string = !in_string,
            '{' if !in_string => delta += 1,
            '}' if !in_string => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn parse_jobs_json(text: &str) -> AdapterResult<Vec<SchedulerJob>> {
    let text = strip_environment_blocks(text);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let data: serde_json::Value =
        serde_json::from_str(&text).context("Cannot parse qstat JSON output")?;

    let mut jobs = Vec::new();
    if let Some(entries) = data["Jobs"].as_object() {
        for (id, value) in entries {
            jobs.push(parse_job(id, value)?);
        }
    }
    Ok(jobs)
}

fn parse_job(id: &str, value: &serde_json::Value) -> AdapterResult<SchedulerJob> {
    let state = value["job_state"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Job {id} has no job_state"))?;
    let owner = value["Job_Owner"].as_str().unwrap_or_default();
    // Job_Owner has the form user@submit-host.
    let owner = owner.split('@').next().unwrap_or_default().to_string();

    let mut resources = Map::default();
    let mut node_count = 1;
    if let Some(list) = value["Resource_List"].as_object() {
        for (key, resource) in list {
            resources.insert(key.clone(), json_to_string(resource));
        }
        if let Some(nodect) = list.get("nodect").and_then(|v| v.as_u64()) {
            node_count = nodect;
        }
    }

    Ok(SchedulerJob {
        id: id.to_string(),
        name: value["Job_Name"].as_str().unwrap_or_default().to_string(),
        owner,
        queue: value["queue"].as_str().unwrap_or_default().to_string(),
        state: parse_job_state(state)?,
        node_count,
        resources,
        submitted_at: value["qtime"]
            .as_str()
            .and_then(|v| parse_pbs_datetime(v).ok())
            .map(local_to_system_time),
    })
}

fn parse_job_state(state: &str) -> AdapterResult<JobState> {
    Ok(match state {
        "Q" | "H" | "W" | "T" => JobState::Queued,
        "R" | "E" | "B" | "S" => JobState::Running,
        "F" | "X" => JobState::Finished,
        other => anyhow::bail!("Unknown PBS job state {other}"),
    })
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OwnerListingRow {
    pub job_id: String,
    pub owner: String,
    pub queue: String,
    pub state: char,
}

/// Parses the fixed-width columnar output of the owner listing. Rows follow
/// a dashed separator line; tokens are positional. Job ids in this shape may
/// be truncated and must be reconciled against a structured query.
fn parse_owner_listing(text: &str) -> Vec<OwnerListingRow> {
    let mut rows = Vec::new();
    let mut in_rows = false;
    for line in text.lines() {
        if !in_rows {
            in_rows = line.trim_start().starts_with("---");
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 10 {
            continue;
        }
        rows.push(OwnerListingRow {
            job_id: tokens[0].to_string(),
            owner: tokens[1].to_string(),
            queue: tokens[2].to_string(),
            state: tokens[9].chars().next().unwrap_or('?'),
        });
    }
    rows
}

/// Numeric sequence part of a (possibly truncated) job id, valid as a qstat
/// query argument on its own.
fn sequence_id(job_id: &str) -> &str {
    job_id.split('.').next().unwrap_or(job_id)
}

/// Keeps only jobs whose full id matches one of the truncated listing ids by
/// prefix. Guards against the structured re-query resolving a recycled
/// sequence number to an unrelated job.
fn reconcile_truncated_ids(rows: &[OwnerListingRow], jobs: Vec<SchedulerJob>) -> Vec<SchedulerJob> {
    jobs.into_iter()
        .filter(|job| {
            rows.iter()
                .any(|row| job.id.starts_with(row.job_id.trim_end_matches('*')))
        })
        .collect()
}

fn parse_nodes_json(text: &str) -> AdapterResult<Vec<NodeInfo>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let data: serde_json::Value =
        serde_json::from_str(text).context("Cannot parse pbsnodes JSON output")?;

    let mut nodes = Vec::new();
    if let Some(entries) = data["nodes"].as_object() {
        for (host, value) in entries {
            nodes.push(parse_node(host, value)?);
        }
    }
    Ok(nodes)
}

fn parse_node(host: &str, value: &serde_json::Value) -> AdapterResult<NodeInfo> {
    let state = value["state"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Node {host} has no state"))?;
    let states = parse_state_set(state)
        .map_err(|e| anyhow::anyhow!("Node {host} has an invalid state: {e}"))?;

    let collect = |key: &str| -> Map<String, String> {
        value[key]
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_string(v)))
                    .collect()
            })
            .unwrap_or_default()
    };

    // Node job entries have the form <cpu-index>/<job-id>.
    let jobs = value["jobs"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str())
                .map(|v| v.split('/').next_back().unwrap_or(v).to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(NodeInfo {
        host: host.to_string(),
        states,
        resources_available: collect("resources_available"),
        resources_assigned: collect("resources_assigned"),
        jobs,
    })
}

fn parse_pbs_datetime(datetime: &str) -> AdapterResult<chrono::NaiveDateTime> {
    Ok(chrono::NaiveDateTime::parse_from_str(
        datetime,
        "%a %b %d %H:%M:%S %Y",
    )?)
}

fn local_to_system_time(datetime: chrono::NaiveDateTime) -> SystemTime {
    match chrono::Local.from_local_datetime(&datetime) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt.into(),
        chrono::LocalResult::None => SystemTime::now(),
    }
}
