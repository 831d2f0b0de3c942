use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{DeleteParams, PostParams};

use crate::config::{Config, ContainerResourcesConfig, K8sJobRunnerConfig};
use crate::queue::RunnerJob;
use crate::queue::runner::{Runner, RunnerError};
use crate::runtime::block_on;
use crate::utilities::create_kube_client;

const LABEL_PREFIX: &str = "askui.com";
const EXIT_SIGNALS_MOUNT_PATH: &str = "/opt/exit-signals";
const TTL_SECONDS_AFTER_FINISHED: i32 = 120;

/// Runs a job as a Kubernetes batch Job with two containers: the runner
/// itself and the UI controller. The controller must outlive the runner so
/// in-flight automation requests do not error out, hence the exit-code
/// rendezvous file on a shared tmpfs volume.
pub struct K8sJobRunner {
    config: K8sJobRunnerConfig,
    base_config: Config,
    kube_client: kube::Client,
    k8s_job_name: Option<String>,
}

impl K8sJobRunner {
    pub fn new(config: K8sJobRunnerConfig, base_config: Config) -> Result<Self, RunnerError> {
        let kube_client = block_on(create_kube_client()).map_err(|e| RunnerError::KubeApi {
            raw_error_message: e.to_string(),
        })?;

        Ok(K8sJobRunner {
            config,
            base_config,
            kube_client,
            k8s_job_name: None,
        })
    }

    fn job_api(&self) -> Api<Job> {
        Api::namespaced(self.kube_client.clone(), &self.config.namespace)
    }

    fn read_status(&self) -> Result<JobStatus, RunnerError> {
        let name = self.k8s_job_name.as_ref().ok_or_else(|| RunnerError::KubeApi {
            raw_error_message: "no kubernetes job has been created or started yet".to_string(),
        })?;

        let job = block_on(self.job_api().get(name)).map_err(|e| {
            if let kube::Error::Api(api_err) = &e {
                if api_err.code == 404 {
                    error!("the k8s job {} might not exist anymore: {}", name, api_err);
                }
            }
            RunnerError::KubeApi {
                raw_error_message: e.to_string(),
            }
        })?;

        job.status.ok_or_else(|| RunnerError::KubeApi {
            raw_error_message: format!("the k8s job {name} has no status"),
        })
    }
}

impl Runner for K8sJobRunner {
    fn start(&mut self, job: &RunnerJob) -> Result<(), RunnerError> {
        let job_config = self.base_config.derive_job_config(job.data.clone());
        let job_config_json = serde_json::to_string(&job_config).map_err(|e| RunnerError::CannotWriteConfig {
            raw_error_message: e.to_string(),
        })?;

        let k8s_job = build_k8s_job(&self.config, job, &job_config_json, self.base_config.job_timeout);
        let name = k8s_job
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| k8s_job_name(job));

        info!("starting job {} as k8s job {} in namespace {}", job.id, name, self.config.namespace);
        block_on(self.job_api().create(&PostParams::default(), &k8s_job)).map_err(|e| RunnerError::KubeApi {
            raw_error_message: e.to_string(),
        })?;

        self.k8s_job_name = Some(name);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        match self.read_status() {
            Ok(status) => !job_has_passed(&status) && !job_has_failed(&status),
            Err(err) => {
                error!("cannot read k8s job status: {}", err);
                false
            }
        }
    }

    fn has_passed(&mut self) -> bool {
        match self.read_status() {
            Ok(status) => job_has_passed(&status),
            Err(_) => false,
        }
    }

    fn has_failed(&mut self) -> bool {
        // an unreadable status counts as failed, the job is gone either way
        match self.read_status() {
            Ok(status) => job_has_failed(&status),
            Err(_) => true,
        }
    }

    fn stop(&mut self) {
        let Some(name) = self.k8s_job_name.as_ref() else {
            return;
        };

        if let Err(err) = block_on(self.job_api().delete(name, &DeleteParams::default())) {
            error!("cannot delete k8s job {}: {}", name, err);
        }
    }
}

pub fn job_has_passed(status: &JobStatus) -> bool {
    status.succeeded.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0 && status.failed.unwrap_or(0) == 0
}

pub fn job_has_failed(status: &JobStatus) -> bool {
    status.failed.unwrap_or(0) > 0
}

fn k8s_job_name(job: &RunnerJob) -> String {
    format!("askui-runner-{}-{}", job.id, job.tries)
}

fn to_resource_requirements(resources: &ContainerResourcesConfig) -> ResourceRequirements {
    let to_quantities = |map: &BTreeMap<String, String>| -> BTreeMap<String, Quantity> {
        map.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect()
    };

    ResourceRequirements {
        requests: Some(to_quantities(&resources.requests)),
        limits: Some(to_quantities(&resources.limits)),
        ..Default::default()
    }
}

/// Builds the two-container batch Job submitted for a leased job.
///
/// Known limitation kept from the wire protocol: the config JSON is passed
/// single-quoted through `sh -c`, so single quotes inside the job `data`
/// blob are not escape-safe.
pub fn build_k8s_job(config: &K8sJobRunnerConfig, job: &RunnerJob, job_config_json: &str, job_timeout: u64) -> Job {
    let name = k8s_job_name(job);

    let labels: BTreeMap<String, String> = [
        ("app.kubernetes.io/name".to_string(), name.clone()),
        ("app.kubernetes.io/instance".to_string(), name.clone()),
        (
            "app.kubernetes.io/version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("app.kubernetes.io/component".to_string(), "runner".to_string()),
        ("app.kubernetes.io/part-of".to_string(), "runner".to_string()),
        (format!("{LABEL_PREFIX}/runner-job-id"), job.id.clone()),
        (
            format!("{LABEL_PREFIX}/workspace-id"),
            job.data.credentials.workspace_id.clone(),
        ),
        (format!("{LABEL_PREFIX}/runner-id"), job.runner_id.clone()),
    ]
    .into_iter()
    .collect();

    let runner_script = format!(
        "askui-runner --config '{job_config_json}';\n\
         exit_code=$?;\n\
         echo -n \"$exit_code\" > {EXIT_SIGNALS_MOUNT_PATH}/EXIT;\n\
         exit $exit_code;\n"
    );

    // Does not handle pod restart: the pre-existing EXIT file makes the
    // controller exit immediately. backoffLimit=0 keeps that from mattering.
    let controller_script = format!(
        "./entrypoint.sh &\n\
         while [ ! -f {EXIT_SIGNALS_MOUNT_PATH}/EXIT ]; do\n\
             sleep 5;\n\
         done;\n\
         exit $(cat {EXIT_SIGNALS_MOUNT_PATH}/EXIT);\n"
    );

    let runner_container = Container {
        name: "askui-runner".to_string(),
        image: Some(config.runner_container.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![runner_script]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "exit-signals".to_string(),
                mount_path: EXIT_SIGNALS_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "cache-volume".to_string(),
                mount_path: "/dev/shm".to_string(),
                ..Default::default()
            },
        ]),
        resources: Some(to_resource_requirements(&config.runner_container.resources)),
        ..Default::default()
    };

    let controller_container = Container {
        name: "askui-controller".to_string(),
        image: Some(config.controller_container.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![controller_script]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "exit-signals".to_string(),
                mount_path: EXIT_SIGNALS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "cache-volume".to_string(),
                mount_path: "/dev/shm".to_string(),
                ..Default::default()
            },
        ]),
        resources: Some(to_resource_requirements(&config.controller_container.resources)),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "exit-signals".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "cache-volume".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: Some(Quantity(config.shared_memory.clone())),
            }),
            ..Default::default()
        },
    ];

    let tolerations = if config.tolerations.is_empty() {
        None
    } else {
        Some(
            config
                .tolerations
                .iter()
                .map(|t| Toleration {
                    key: t.key.clone(),
                    operator: t.operator.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                    toleration_seconds: t.toleration_seconds,
                })
                .collect(),
        )
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            backoff_limit: Some(0),
            active_deadline_seconds: Some(job_timeout as i64),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![runner_container, controller_container],
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: "docker".to_string(),
                    }]),
                    volumes: Some(volumes),
                    node_selector: config.node_selector.clone(),
                    tolerations,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
