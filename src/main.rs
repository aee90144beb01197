use serde::Serialize;
use tackle::application_port::SessionService;
use tackle::client::Client;
use tackle::domain_model::{ProfileUpdate, RegisterInput, UserId};
use tackle::logger::*;
use tackle::settings::*;

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    let session = &client.session;
    let state = session.hydrate().await;
    debug!(authenticated = state.is_authenticated, "session hydrated");

    match command {
        Command::Login { email, password } => {
            let result = session.login(&email, &password).await?;
            print_json(&result.user)?;
        }
        Command::Register {
            email,
            password,
            first_name,
            last_name,
            username,
        } => {
            let input =
                RegisterInput::from_names(email, password, &first_name, &last_name, username);
            let result = session.register(input).await?;
            print_json(&result.user)?;
        }
        Command::Whoami => {
            let user = session.reload_profile().await?;
            print_json(&user)?;
        }
        Command::Profile => {
            let user = client.api.profile().await?;
            print_json(&user)?;
        }
        Command::Update {
            full_name,
            username,
            avatar,
        } => {
            let update = ProfileUpdate {
                full_name,
                username,
                avatar,
            };
            if update.is_empty() {
                return Err(anyhow::anyhow!("nothing to update"));
            }
            let user = session.update_profile(update).await?;
            print_json(&user)?;
        }
        Command::Search { username } => {
            let page = client.api.search_users(&username).await?;
            print_json(&page)?;
        }
        Command::Follow { user_id } => {
            let result = client.api.follow_user(&UserId(user_id)).await?;
            print_json(&result)?;
        }
        Command::Refresh => {
            if !session.refresh_token().await {
                return Err(anyhow::anyhow!("token refresh failed; signed out"));
            }
            print_json(&serde_json::json!({ "refreshed": true }))?;
        }
        Command::Logout => {
            session.logout().await;
            print_json(&serde_json::json!({ "signedOut": true }))?;
        }
        Command::Status => {
            let state = session.state();
            print_json(&serde_json::json!({
                "isAuthenticated": state.is_authenticated,
                "user": state.user,
            }))?;
        }
        Command::Health => {
            let health = client.api.health_check().await?;
            print_json(&health)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    debug!(?project_settings);
    let logger_config = LogConfig {
        filter: project_settings.log.filter.clone(),
    };
    logger.reload_from_config(&logger_config)?;

    let client = Client::try_new(&project_settings).await?;
    let result = run(&client, cli.command).await;

    let shutdown_timeout = std::time::Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, client.shutdown())
        .await
        .is_err()
    {
        error!("client shutdown timed out");
    }

    result
}
