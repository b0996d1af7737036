//! Amazon ECS implementation of [`TaskPlatform`].

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, KeyValuePair, LaunchType,
    NetworkConfiguration, Tag, TaskOverride,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::TaskPlatform;
use super::types::{
    ContainerDetail, EnvPair, LaunchedTask, RunTaskSpec, TaskStateEvent, TaskTag,
};
use crate::config::OutpostConfig;

/// ECS stop reasons are capped at 255 characters.
const MAX_STOP_REASON_LEN: usize = 255;

/// Launches agent tasks on an ECS cluster (Fargate).
#[derive(Clone)]
pub struct EcsTaskPlatform {
    client: Client,
    cluster: String,
    subnets: Vec<String>,
    security_groups: Vec<String>,
    assign_public_ip: AssignPublicIp,
}

impl EcsTaskPlatform {
    pub fn new(client: Client, config: &OutpostConfig) -> Self {
        Self {
            client,
            cluster: config.cluster.clone(),
            subnets: config.subnets.clone(),
            security_groups: config.security_groups.clone(),
            assign_public_ip: if config.assign_public_ip {
                AssignPublicIp::Enabled
            } else {
                AssignPublicIp::Disabled
            },
        }
    }

    fn network_configuration(&self) -> Result<NetworkConfiguration> {
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.subnets.clone()))
            .set_security_groups(Some(self.security_groups.clone()))
            .assign_public_ip(self.assign_public_ip.clone())
            .build()
            .context("failed to build VPC configuration (no subnets configured?)")?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }
}

#[async_trait]
impl TaskPlatform for EcsTaskPlatform {
    async fn run_task(&self, spec: &RunTaskSpec) -> Result<LaunchedTask> {
        let mut env: Vec<KeyValuePair> = spec
            .env
            .iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();
        // Extra secret references are resolved by the container entrypoint
        // at start; the baseline secrets are declared on the task
        // definition itself.
        if !spec.secret_refs.is_empty() {
            env.push(
                KeyValuePair::builder()
                    .name("OUTPOST_EXTRA_SECRETS")
                    .value(spec.secret_refs.join(","))
                    .build(),
            );
        }

        let mut container = ContainerOverride::builder()
            .name("worker")
            .set_environment(Some(env));
        if let Some(cpu) = spec.cpu_units {
            container = container.cpu(cpu);
        }
        if let Some(memory) = spec.memory_mb {
            container = container.memory(memory);
        }

        let overrides = TaskOverride::builder()
            .container_overrides(container.build())
            .build();

        let mut request = self
            .client
            .run_task()
            .cluster(&self.cluster)
            .task_definition(&spec.template)
            .group(&spec.group)
            .launch_type(LaunchType::Fargate)
            .network_configuration(self.network_configuration()?)
            .overrides(overrides)
            .started_by(format!("outpost:{}", spec.dispatch_id));
        for (key, value) in &spec.tags {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("run_task failed for dispatch {}", spec.dispatch_id))?;

        if let Some(failure) = response.failures().first() {
            bail!(
                "platform rejected task: {}",
                failure.reason().unwrap_or("unknown reason")
            );
        }

        let task_arn = response
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .map(str::to_owned);

        match task_arn {
            Some(task_arn) if !task_arn.is_empty() => {
                info!(
                    dispatch_id = %spec.dispatch_id,
                    task_arn = %task_arn,
                    agent = %spec.agent_kind,
                    "task accepted by platform"
                );
                Ok(LaunchedTask { task_arn })
            }
            _ => bail!("platform returned no task ARN"),
        }
    }

    async fn stop_task(&self, task_arn: &str, reason: &str) -> Result<()> {
        let reason: String = reason.chars().take(MAX_STOP_REASON_LEN).collect();
        self.client
            .stop_task()
            .cluster(&self.cluster)
            .task(task_arn)
            .reason(reason)
            .send()
            .await
            .with_context(|| format!("stop_task failed for {task_arn}"))?;
        debug!(task_arn = %task_arn, "stop issued");
        Ok(())
    }

    async fn describe_task(&self, task_arn: &str) -> Result<Option<TaskStateEvent>> {
        let response = self
            .client
            .describe_tasks()
            .cluster(&self.cluster)
            .tasks(task_arn)
            .send()
            .await
            .with_context(|| format!("describe_tasks failed for {task_arn}"))?;

        Ok(response.tasks().first().map(task_to_event))
    }
}

fn smithy_to_chrono(dt: &aws_sdk_ecs::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn task_to_event(task: &aws_sdk_ecs::types::Task) -> TaskStateEvent {
    TaskStateEvent {
        task_arn: task.task_arn().unwrap_or_default().to_owned(),
        cluster_arn: task.cluster_arn().map(str::to_owned),
        last_status: task.last_status().unwrap_or_default().to_owned(),
        desired_status: task.desired_status().map(str::to_owned),
        stop_code: task
            .stop_code()
            .and_then(|code| code.as_str().parse().ok()),
        stopped_reason: task.stopped_reason().map(str::to_owned),
        stopped_at: task.stopped_at().and_then(smithy_to_chrono),
        started_by: task.started_by().map(str::to_owned),
        group: task.group().map(str::to_owned),
        containers: task
            .containers()
            .iter()
            .map(|c| ContainerDetail {
                name: c.name().map(str::to_owned),
                exit_code: c.exit_code(),
                reason: c.reason().map(str::to_owned),
                created_at: None,
                started_at: None,
                stopped_at: None,
            })
            .collect(),
        overrides: task.overrides().map(|o| super::types::TaskOverrides {
            container_overrides: o
                .container_overrides()
                .iter()
                .map(|c| super::types::ContainerOverride {
                    name: c.name().map(str::to_owned),
                    environment: c
                        .environment()
                        .iter()
                        .map(|kv| EnvPair {
                            name: kv.name().unwrap_or_default().to_owned(),
                            value: kv.value().unwrap_or_default().to_owned(),
                        })
                        .collect(),
                })
                .collect(),
        }),
        tags: task
            .tags()
            .iter()
            .map(|t| TaskTag {
                key: t.key().unwrap_or_default().to_owned(),
                value: t.value().unwrap_or_default().to_owned(),
            })
            .collect(),
    }
}
