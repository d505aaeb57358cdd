//! Built-in pipeline templates for `pipewright template`.

#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value)
    pub name: &'static str,
    pub description: &'static str,
}

pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "minimal",
            description: "Single no-op task, no dependencies",
        },
        TemplateInfo {
            name: "transfer",
            description: "Local transfer and query commands with retry settings",
        },
        TemplateInfo {
            name: "user-behaviour",
            description: "Daily user-behaviour pipeline with an external classification job",
        },
    ]
}

/// YAML content of the named template, or `None` if there is no such template
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "minimal" => Some(TEMPLATE_MINIMAL),
        "transfer" => Some(TEMPLATE_TRANSFER),
        "user-behaviour" | "user_behaviour" => Some(TEMPLATE_USER_BEHAVIOUR),
        _ => None,
    }
}

const TEMPLATE_MINIMAL: &str = r#"# pipewright pipeline: minimal example
name: minimal-pipeline
description: "A single no-op task"

tasks:
  - name: hello
    type: no_op
"#;

const TEMPLATE_TRANSFER: &str = r#"# pipewright pipeline: local commands
# Transfer and query tasks run a local program; every parameter other than
# command/args/workdir/timeout_secs is exported as PIPEWRIGHT_PARAM_<NAME>.
name: transfer-pipeline
description: "Copy a daily extract and load it"

config:
  max_parallel: 2
  retry:
    max_retries: 3
    backoff: exponential
    delay_secs: 10
    max_delay_secs: 300

tasks:
  - name: extract
    type: data_transfer
    params:
      command: /usr/bin/cp
      args: "/data/export/orders_{{ ds_nodash }}.csv /data/stage/"

  - name: load
    type: external_query
    depends_on: [extract]
    params:
      command: /usr/local/bin/load-orders
      args: "--date {{ ds }}"
      timeout_secs: "900"
    retry:
      max_retries: 1

  - name: done
    type: no_op
    depends_on: [load]
"#;

const TEMPLATE_USER_BEHAVIOUR: &str = r#"# pipewright pipeline: user behaviour metrics
# Requires job_api_url in the settings and the env values
# data_bucket, script_bucket and job_flow_id.
name: user_behaviour
description: "Load user purchases and movie reviews, classify reviews, build behaviour metrics"
schedule: "0 0 0 * * *"

config:
  max_parallel: 4
  depends_on_past: true
  retry:
    max_retries: 1
    delay_secs: 300

tasks:
  - name: extract_user_purchase_data
    type: data_transfer
    params:
      command: /usr/local/bin/export-user-purchase
      args: "--date {{ ds }} --out /tmp/user_purchase/{{ ds }}/user_purchase.csv"

  - name: user_purchase_to_stage_data_lake
    type: data_transfer
    depends_on: [extract_user_purchase_data]
    params:
      command: /usr/local/bin/upload
      args: "/tmp/user_purchase/{{ ds }}/user_purchase.csv s3://${data_bucket}/stage/user_purchase/{{ ds }}/user_purchase.csv"

  - name: user_purchase_stage_data_lake_to_stage_tbl
    type: external_query
    depends_on: [user_purchase_to_stage_data_lake]
    params:
      command: /usr/local/bin/run-query
      # Reaches run-query whole as PIPEWRIGHT_PARAM_QUERY; args are split on whitespace.
      query: "ALTER TABLE spectrum.user_purchase_staging ADD IF NOT EXISTS PARTITION (insert_date='{{ ds }}')"

  - name: movie_review_to_raw_data_lake
    type: data_transfer
    params:
      command: /usr/local/bin/upload
      args: "/data/movie_review/movie_review.csv s3://${data_bucket}/raw/movie_review/{{ ds }}/movie.csv"

  - name: spark_script_to_s3
    type: data_transfer
    params:
      command: /usr/local/bin/upload
      args: "/opt/scripts/random_text_classification.py s3://${script_bucket}/scripts/random_text_classification.py"

  - name: start_emr_movie_classification_script
    type: external_job_submit
    depends_on: [movie_review_to_raw_data_lake, spark_script_to_s3]
    params:
      job_flow_id: "${job_flow_id}"
      input: "s3://${data_bucket}/raw/movie_review/{{ ds }}/movie.csv"
      output: "s3://${data_bucket}/stage/movie_review/{{ ds }}"
    steps:
      - Name: move raw data from S3 to HDFS
        ActionOnFailure: CANCEL_AND_WAIT
        HadoopJarStep:
          Jar: command-runner.jar
          Args: ["s3-dist-cp", "--src=s3://${data_bucket}/raw/movie_review", "--dest=/movie"]
      - Name: classify movie reviews
        ActionOnFailure: CANCEL_AND_WAIT
        HadoopJarStep:
          Jar: command-runner.jar
          Args: ["spark-submit", "--deploy-mode", "client", "s3://${script_bucket}/scripts/random_text_classification.py"]
      - Name: move clean data from HDFS to S3
        ActionOnFailure: CANCEL_AND_WAIT
        HadoopJarStep:
          Jar: command-runner.jar
          Args: ["s3-dist-cp", "--src=/output", "--dest=s3://${data_bucket}/stage/movie_review"]

  - name: wait_for_movie_classification_transformation
    type: external_job_wait
    depends_on: [start_emr_movie_classification_script]
    submit_task: start_emr_movie_classification_script
    poll_interval: 30
    timeout: 7200

  - name: generate_user_behavior_metric
    type: external_query
    depends_on:
      - user_purchase_stage_data_lake_to_stage_tbl
      - wait_for_movie_classification_transformation
    params:
      command: /usr/local/bin/run-query
      args: "--file /opt/sql/user_behavior_metric.sql --date {{ ds }}"

  - name: end_of_data_pipeline
    type: no_op
    depends_on: [generate_user_behavior_metric]
"#;
