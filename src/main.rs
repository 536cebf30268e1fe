use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;

use murmur::config::Config;
use murmur::remote::{Comment, Post};
use murmur::{telemetry, SocialClient};

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "Query and update a social feed through the local query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/murmur/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List comments on a post, newest first
  Comments { post_id: String },
  /// Add a comment to a post
  Comment {
    post_id: String,
    text: String,
    /// Id of the commenting user
    #[arg(short, long)]
    user: String,
  },
  /// Like or unlike a comment
  Like {
    post_id: String,
    comment_id: String,
    /// Id of the acting user
    #[arg(short, long)]
    user: String,
  },
  /// List recent posts
  Posts,
  /// Show one post
  Post { post_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = telemetry::init(&config.logging)?;

  let client = SocialClient::from_config(&config)?;
  info!(endpoint = %config.backend.endpoint, "Client ready");

  match args.command {
    Command::Comments { post_id } => {
      let comments = client.get_comments(&post_id).await?;
      print_comments(&comments);
    }
    Command::Comment {
      post_id,
      text,
      user,
    } => {
      // Load the list so the new comment lands on top of it
      client.get_comments(&post_id).await?;
      let created = client.create_comment(&post_id, &text, &user).await?;
      println!("created {}", created.id);
    }
    Command::Like {
      post_id,
      comment_id,
      user,
    } => {
      client.get_comments(&post_id).await?;
      match client.toggle_like(&post_id, &comment_id, &user).await? {
        Some(comment) => println!("{} now has {} likes", comment.id, comment.like_count()),
        None => println!("comment {} not found on post {}", comment_id, post_id),
      }
    }
    Command::Posts => {
      for post in client.get_recent_posts().await? {
        print_post(&post);
      }
    }
    Command::Post { post_id } => {
      let post = client.get_post_by_id(&post_id).await?;
      print_post(&post);
    }
  }

  Ok(())
}

fn print_comments(comments: &[Comment]) {
  if comments.is_empty() {
    println!("no comments");
    return;
  }
  for comment in comments {
    let author = comment
      .author
      .as_ref()
      .map(|a| a.username.as_str())
      .unwrap_or(comment.author_id.as_str());
    println!(
      "{}  {:<16} {:>3} likes  {}",
      comment.id,
      author,
      comment.like_count(),
      comment.text
    );
  }
}

fn print_post(post: &Post) {
  println!(
    "{}  {} likes  {}  {}",
    post.id,
    post.likes.len(),
    post.created_at.format("%Y-%m-%d %H:%M"),
    post.caption
  );
}
