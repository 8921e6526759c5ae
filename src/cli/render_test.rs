use anyhow::Result;
use clap::Args;

use crate::animation::RenderClient;
use crate::config::Config;

const TEST_SCENE: &str = r#"from manim import *

class TestScene(Scene):
    def construct(self):
        circle = Circle(color=BLUE)
        self.play(Create(circle))
        square = Square(color=RED).next_to(circle, RIGHT)
        self.play(Create(square))
        self.wait(1)
"#;

#[derive(Args)]
pub struct RenderTestArgs {
    /// Only run the health check
    #[arg(long)]
    pub health_only: bool,
}

pub async fn run(args: RenderTestArgs, config: &Config) -> Result<()> {
    let client = RenderClient::new(&config.renderer)?;
    println!("Rendering service: {}", client.base_url());

    let health = client.health_check().await;
    match health.path {
        Some(path) if health.healthy => println!("Health:  ok ({} -> {})", path, health.detail),
        _ => println!("Health:  unreachable ({})", health.detail),
    }

    if args.health_only {
        if !health.healthy {
            anyhow::bail!("rendering service is not healthy");
        }
        return Ok(());
    }

    let message_id = format!("render-test-{}", uuid::Uuid::new_v4());
    let url = client.execute(TEST_SCENE, &message_id, None).await?;
    println!("Render:  ok");
    println!("URL:     {}", url);

    Ok(())
}
