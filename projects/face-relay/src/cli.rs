use crate::pipeline::findface::Credentials;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "FACE_RELAY_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Base URL of the FindFace Multi API; remote submission is disabled without it
    #[arg(long, env = "FINDFACE_URL")]
    pub findface_url: Option<String>,

    /// FindFace operator used to discover cameras
    #[arg(long, env = "FINDFACE_USER")]
    pub findface_user: Option<String>,

    #[arg(long, env = "FINDFACE_PASSWORD", hide_env_values = true)]
    pub findface_password: Option<String>,

    /// Device identifier for the FindFace session
    #[arg(long, env = "FINDFACE_UUID")]
    pub findface_uuid: Option<String>,

    /// Host to bind the status API to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind the status API to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// Do not start the status API
    #[arg(long)]
    pub no_status_server: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Camera discovery needs the whole login triple.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.findface_user, &self.findface_password, &self.findface_uuid) {
            (Some(user), Some(password), Some(uuid)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
                uuid: uuid.clone(),
            }),
            _ => None,
        }
    }
}
