use clap::Parser;

/// regrm: delete an image from a token-authenticated Docker Registry V2
///
/// The registry can only delete a manifest by digest, which removes every tag
/// pointing at it. Use --tag-only to re-push the sibling tags afterwards.
#[derive(Parser, Debug)]
#[command(name = "regrm", version, about)]
pub struct Cli {
    /// Image to delete (e.g., registry.example.com:5000/team/app:v1)
    #[arg(value_name = "IMAGE", required_unless_present = "raw", conflicts_with = "raw")]
    pub image: Option<String>,

    /// Send one authenticated request and print the full response
    #[arg(long, num_args = 2..=3, value_names = ["URL", "METHOD", "HEADER"])]
    pub raw: Option<Vec<String>>,

    /// Skip TLS certificate verification (self-signed registries)
    #[arg(short = 'k', long, default_value_t = false)]
    pub insecure: bool,

    /// Registry username
    #[arg(short, long, env = "REGRM_USER")]
    pub user: Option<String>,

    /// Prompt for the registry password
    #[arg(short, long, default_value_t = false)]
    pub password: bool,

    /// Registry password (used when not prompting)
    #[arg(long = "password-env", env = "REGRM_PASSWORD", hide = true, hide_env_values = true)]
    pub password_env: Option<String>,

    /// Re-push other tags that shared the deleted digest
    #[arg(short, long, default_value_t = false)]
    pub tag_only: bool,

    /// Talk plain HTTP to the registry instead of HTTPS
    #[arg(long, default_value_t = false)]
    pub plain_http: bool,

    /// Local image cache CLI used by --tag-only
    #[arg(long, env = "REGRM_CACHE_TOOL", default_value = "docker")]
    pub cache_tool: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_mode() {
        let cli = Cli::try_parse_from(["regrm", "-k", "-t", "registry:5000/app/foo:v1"]).unwrap();
        assert_eq!(cli.image.as_deref(), Some("registry:5000/app/foo:v1"));
        assert!(cli.insecure);
        assert!(cli.tag_only);
        assert!(cli.raw.is_none());
    }

    #[test]
    fn test_parse_raw_mode_with_header() {
        let cli = Cli::try_parse_from([
            "regrm",
            "--raw",
            "host/v2/repo/manifests/latest",
            "GET",
            "Accept: foo",
        ])
        .unwrap();
        assert!(cli.image.is_none());
        assert_eq!(
            cli.raw.unwrap(),
            vec!["host/v2/repo/manifests/latest", "GET", "Accept: foo"]
        );
    }

    #[test]
    fn test_missing_image_is_rejected() {
        assert!(Cli::try_parse_from(["regrm", "-k"]).is_err());
    }

    #[test]
    fn test_raw_requires_method() {
        assert!(Cli::try_parse_from(["regrm", "--raw", "host/v2/"]).is_err());
    }
}
