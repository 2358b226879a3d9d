use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use review_engine::{CapacityPolicy, ReviewContext, ReviewPolicy};
use shared::{
    domain::{ProgramId, ProgramType, StudentId},
    protocol::ProgramDraft,
};
use storage::{NewStudent, Storage};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/review.db")]
    database_url: String,
    #[arg(long, default_value_t = CapacityPolicy::CountAll)]
    capacity_policy: CapacityPolicy,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateProgram {
        name: String,
        #[arg(long)]
        slots: i64,
        #[arg(long, default_value_t = 2.0)]
        min_gwa: f64,
        #[arg(long, default_value = "internal")]
        program_type: String,
        #[arg(long)]
        posted_by: String,
        #[arg(long = "requirement")]
        requirements: Vec<String>,
        #[arg(long = "benefit")]
        benefits: Vec<String>,
    },
    CreateStudent {
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "")]
        school: String,
        #[arg(long, default_value = "")]
        course: String,
    },
    Apply {
        program_id: i64,
        student_id: i64,
    },
    UploadDocument {
        program_id: i64,
        student_id: i64,
        file: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
    },
    Capacity {
        program_id: i64,
    },
    Enrollments {
        program_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = ReviewContext::new(storage).with_policy(ReviewPolicy {
        capacity: cli.capacity_policy,
        ..ReviewPolicy::default()
    });

    match cli.command {
        Command::CreateProgram {
            name,
            slots,
            min_gwa,
            program_type,
            posted_by,
            requirements,
            benefits,
        } => {
            let program_type: ProgramType = program_type.parse()?;
            let draft = ProgramDraft {
                name,
                program_type,
                total_slots: slots,
                min_gwa,
                eligibility: Default::default(),
                requirements,
                benefits,
                posted_by,
            };
            let program = review_engine::create_program(&ctx, &draft).await?;
            println!("created program_id={}", program.program_id);
        }
        Command::CreateStudent {
            email,
            first_name,
            last_name,
            school,
            course,
        } => {
            let student_id = ctx
                .storage
                .create_student(&NewStudent {
                    first_name: &first_name,
                    last_name: &last_name,
                    school: &school,
                    course: &course,
                    email: &email,
                    profile_picture: None,
                })
                .await?;
            println!("created student_id={student_id}");
        }
        Command::Apply {
            program_id,
            student_id,
        } => {
            let enrollment = review_engine::submit_application(
                &ctx,
                StudentId(student_id),
                ProgramId(program_id),
            )
            .await?;
            println!(
                "created enrollment_id={} status={}",
                enrollment.enrollment_id, enrollment.status
            );
        }
        Command::UploadDocument {
            program_id,
            student_id,
            file,
            mime_type,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("{} has no usable file name", file.display()))?;
            let entry = review_engine::upload_document(
                &ctx,
                StudentId(student_id),
                ProgramId(program_id),
                filename,
                &bytes,
                mime_type.as_deref(),
            )
            .await?;
            println!(
                "uploaded {} ({} bytes) to {}",
                entry.document_id, entry.size_bytes, entry.blob_path
            );
        }
        Command::Capacity { program_id } => {
            let snapshot = review_engine::capacity(&ctx, ProgramId(program_id)).await?;
            println!(
                "program_id={} total={} enrolled={} available={}",
                snapshot.program_id,
                snapshot.total_slots,
                snapshot.enrolled,
                snapshot.available_slots
            );
        }
        Command::Enrollments { program_id } => {
            for enrollment in review_engine::list_enrollments(&ctx, ProgramId(program_id)).await? {
                let checked = enrollment.checklist.values().filter(|c| **c).count();
                println!(
                    "enrollment_id={} student_id={} status={} checked={}/{}",
                    enrollment.enrollment_id,
                    enrollment.student_id,
                    enrollment.status,
                    checked,
                    enrollment.checklist.len()
                );
            }
        }
    }

    Ok(())
}
