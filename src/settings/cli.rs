use super::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "tackle", about = "Session client for the angler social API")]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and persist the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and sign in.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        username: String,
    },
    /// Print the signed-in user as returned by the backend.
    Whoami,
    /// Print the signed-in user, served from the query cache when present.
    Profile,
    /// Update profile fields of the signed-in user.
    Update {
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Search users by username.
    Search { username: String },
    /// Follow a user by id.
    Follow { user_id: String },
    /// Force a token refresh.
    Refresh,
    /// Sign out and forget stored credentials.
    Logout,
    /// Print the restored session state.
    Status,
    /// Check backend health.
    Health,
}
