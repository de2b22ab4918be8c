use std::path::PathBuf;

use clap::{Parser, Subcommand};
use db_infra::{ops, ConnectionSpec, DbInfraError, RolePasswords};

#[derive(Parser)]
#[command(name = "pgprov")]
#[command(about = "Postgres provisioning and schema migration tool")]
struct Args {
    /// Database server host
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 5432)]
    port: u16,

    /// Administrative login user
    #[arg(long, default_value = "postgres")]
    user: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Target database name
    #[arg(long)]
    dbname: String,

    /// Migration directory; defaults to migrations/<dbname>
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a new migration file from a message
    New { message: String },
    /// Create the database if it does not exist
    EnsureDb,
    /// Create the admin/readonly/readwrite roles if missing
    EnsureRoles {
        #[arg(long)]
        admin_password: String,
        #[arg(long)]
        ro_password: String,
        #[arg(long)]
        rw_password: String,
    },
    /// Ensure the database exists, then apply all pending migrations
    Prepare,
    /// List pending migrations
    List,
    /// Apply all pending migrations
    Apply,
    /// Roll back the N most recent migrations; 0 lists what could be rolled back
    Rollback { n: usize },
}

async fn run(args: Args) -> Result<(), DbInfraError> {
    let migrations_dir = args
        .migrations_dir
        .unwrap_or_else(|| PathBuf::from("migrations").join(&args.dbname));

    let spec = ConnectionSpec {
        host: args.host,
        port: args.port,
        user: args.user,
        password: args.password,
        dbname: args.dbname,
    };

    match args.command {
        Command::New { message } => {
            let def = migration_store::create(&migrations_dir, &message)?;
            println!("created {}/{}.sql", migrations_dir.display(), def.id);
        }
        Command::EnsureDb => {
            let created = ops::ensure_database(&spec).await?;
            if created {
                println!("database {} created", spec.dbname);
            } else {
                println!("database {} already exists", spec.dbname);
            }
        }
        Command::EnsureRoles {
            admin_password,
            ro_password,
            rw_password,
        } => {
            let roles = ops::ensure_roles(
                &spec,
                &RolePasswords {
                    admin: admin_password,
                    readonly: ro_password,
                    readwrite: rw_password,
                },
            )
            .await?;
            println!(
                "roles ensured: {} {} {}",
                roles.admin, roles.readonly, roles.readwrite
            );
        }
        Command::Prepare => {
            let steps = ops::prepare(&spec, &migrations_dir).await?;
            for step in &steps {
                println!("{} {}", step.sequence, step.id);
            }
            println!("{} migration(s) applied", steps.len());
        }
        Command::List => {
            for (i, def) in ops::list_pending(&spec, &migrations_dir).await?.iter().enumerate() {
                println!("{} {}", i + 1, def.id);
            }
        }
        Command::Apply => {
            let steps = ops::apply_all(&spec, &migrations_dir).await?;
            for step in &steps {
                println!("{} {}", step.sequence, step.id);
            }
            println!("{} migration(s) applied", steps.len());
        }
        Command::Rollback { n } => {
            if n == 0 {
                let candidates = ops::list_rollback_candidates(&spec, &migrations_dir).await?;
                for (i, def) in candidates.iter().enumerate() {
                    println!("{} {}", i + 1, def.id);
                }
            } else {
                let steps = ops::rollback(&spec, &migrations_dir, n).await?;
                for step in &steps {
                    println!("{} {}", step.sequence, step.id);
                }
                println!("{} migration(s) rolled back", steps.len());
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter("db_infra=info,migration_store=info,sqlx=warn")
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("pgprov failed: {e}");
        std::process::exit(1);
    }
}
