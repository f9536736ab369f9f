//! Interactive text menu.
//!
//! Reads one choice per line from `input` and writes prompts to `output`.
//! End of input behaves like choosing "Exit".

use anyhow::{bail, Context, Result};
use mesh_session::ConnectionRegistry;
use mesh_storage::MessageLog;
use mesh_wire::{encode, Direction, Message, EMPTY_TOPIC};
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::config::DEFAULT_PORT;

const RULE: &str = "-------------------";

/// Normalize user input to `host:port`, defaulting the port to 5555
pub fn parse_peer_address(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty address");
    }

    match input.split_once(':') {
        None => Ok(format!("{}:{}", input, DEFAULT_PORT)),
        Some((host, port)) => {
            if host.is_empty() {
                bail!("missing host in {:?}", input);
            }
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid port number {:?}", port))?;
            Ok(format!("{}:{}", host, port))
        }
    }
}

/// Menu driving one node
pub struct Menu<R, W> {
    registry: ConnectionRegistry,
    log: Arc<dyn MessageLog>,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Menu<R, W> {
    pub fn new(registry: ConnectionRegistry, log: Arc<dyn MessageLog>, input: R, output: W) -> Self {
        Self {
            registry,
            log,
            input,
            output,
        }
    }

    /// Show the banner and serve choices until exit or end of input
    pub fn run(&mut self) -> Result<()> {
        self.show_welcome()?;
        loop {
            self.show_main_menu()?;
            let Some(choice) = self.read_line()? else {
                crate::component_debug!("ui", "Input closed, leaving menu");
                return Ok(());
            };
            match choice.trim() {
                "1" => self.connect_peer()?,
                "2" => self.list_peers()?,
                "3" => self.send_message()?,
                "4" => self.broadcast_message()?,
                "5" => self.inbox()?,
                "0" => return Ok(()),
                _ => writeln!(self.output, "Invalid option")?,
            }
        }
    }

    fn show_welcome(&mut self) -> Result<()> {
        writeln!(self.output, "\n=====================================")?;
        writeln!(self.output, "  Welcome to P2P Messenger")?;
        writeln!(self.output, "=====================================")?;
        writeln!(
            self.output,
            "Your listening address: {}",
            self.registry.own_address()
        )?;
        writeln!(
            self.output,
            "You can share the above address with other peers to connect."
        )?;
        Ok(())
    }

    fn show_main_menu(&mut self) -> Result<()> {
        writeln!(self.output, "\n{}", RULE)?;
        writeln!(self.output, "Main Menu:")?;
        writeln!(self.output, "1. Connect peer")?;
        writeln!(self.output, "2. List peers")?;
        writeln!(self.output, "3. Send message")?;
        writeln!(self.output, "4. Broadcast message")?;
        writeln!(self.output, "5. Inbox")?;
        writeln!(self.output, "0. Exit")?;
        writeln!(self.output, "{}", RULE)?;
        self.output.flush()?;
        Ok(())
    }

    fn connect_peer(&mut self) -> Result<()> {
        let address = self.prompt("Enter peer address (ip[:port]): ")?;
        match parse_peer_address(&address) {
            Ok(target) => {
                self.registry.connect(&target)?;
                writeln!(self.output, "Attempted to connect to {}", target)?;
            }
            Err(e) => writeln!(self.output, "Invalid address: {:#}", e)?,
        }
        writeln!(self.output, "{}", RULE)?;
        Ok(())
    }

    fn list_peers(&mut self) -> Result<()> {
        let peers = self.registry.list_peers();
        writeln!(self.output, "\n{}", RULE)?;
        if peers.is_empty() {
            writeln!(self.output, "No peers connected.")?;
        } else {
            writeln!(self.output, "Connected peers:")?;
            for (i, peer) in peers.iter().enumerate() {
                writeln!(self.output, "{}. {}", i + 1, peer)?;
            }
        }
        writeln!(self.output, "{}", RULE)?;
        Ok(())
    }

    fn send_message(&mut self) -> Result<()> {
        writeln!(self.output, "\n{}", RULE)?;
        if self.registry.peer_ids().is_empty() {
            writeln!(self.output, "No connected peers available.")?;
            return Ok(());
        }

        let peer = self.prompt("Enter peer address: ")?;
        let peer = peer.trim();
        if !self.registry.has_peer(peer) {
            writeln!(self.output, "Error: Peer {} is not connected.", peer)?;
            return Ok(());
        }

        let message = self.compose()?;
        self.log.append(message.clone())?;
        self.registry.send_to(peer, encode(&message));
        crate::component_info!("ui", "Sent message to {} (topic: {})", peer, message.topic);

        writeln!(self.output, "Message sent and logged.")?;
        writeln!(self.output, "{}", RULE)?;
        Ok(())
    }

    fn broadcast_message(&mut self) -> Result<()> {
        writeln!(self.output, "\n{}", RULE)?;
        if self.registry.peer_ids().is_empty() {
            writeln!(self.output, "No connected peers available to broadcast.")?;
            return Ok(());
        }

        let message = self.compose()?;
        self.log.append(message.clone())?;
        let reached = self.registry.broadcast(encode(&message));
        crate::component_info!("ui", "Broadcast message to {} peer(s)", reached);

        writeln!(self.output, "Message broadcasted to all peers and logged.")?;
        writeln!(self.output, "{}", RULE)?;
        Ok(())
    }

    fn compose(&mut self) -> Result<Message> {
        let mut topic = self.prompt("Enter topic: ")?;
        if topic.is_empty() {
            topic = EMPTY_TOPIC.to_string();
        }
        let content = self.prompt("Enter message content: ")?;
        Ok(Message::new(
            self.registry.own_address(),
            topic,
            content,
            Direction::Sent,
        ))
    }

    fn inbox(&mut self) -> Result<()> {
        writeln!(self.output, "\n{}", RULE)?;
        writeln!(self.output, "Inbox Menu:")?;
        writeln!(self.output, "1. View Sent")?;
        writeln!(self.output, "2. View Received")?;
        writeln!(self.output, "0. Back")?;
        writeln!(self.output, "{}", RULE)?;
        self.output.flush()?;

        let choice = self.read_line()?.unwrap_or_default();
        match choice.trim() {
            "1" => self.view(Direction::Sent),
            "2" => self.view(Direction::Received),
            "0" | "" => Ok(()),
            _ => {
                writeln!(self.output, "Invalid option.")?;
                Ok(())
            }
        }
    }

    fn view(&mut self, direction: Direction) -> Result<()> {
        let summaries = self.log.summaries(direction);
        writeln!(self.output, "\n{}", RULE)?;
        if summaries.is_empty() {
            writeln!(self.output, "No {} messages.", direction_label(direction))?;
            writeln!(self.output, "{}", RULE)?;
            return Ok(());
        }
        for (i, summary) in summaries.iter().enumerate() {
            writeln!(self.output, "{}. {}", i + 1, summary)?;
        }

        let choice = self.prompt("Enter message number to open, 0 to back: ")?;
        writeln!(self.output, "\n{}", RULE)?;
        let index = match choice.trim().parse::<usize>() {
            Ok(n) if n >= 1 && n <= summaries.len() => n - 1,
            _ => return Ok(()),
        };

        let Some(message) = self.log.list(direction).into_iter().nth(index) else {
            return Ok(());
        };
        writeln!(self.output, "From: {}", message.peer_id)?;
        writeln!(self.output, "Topic: {}", message.topic)?;
        writeln!(self.output, "Content: {}", message.content)?;

        let answer = self.prompt("Delete this message? (y/n): ")?;
        writeln!(self.output, "\n{}", RULE)?;
        if answer.trim().eq_ignore_ascii_case("y") {
            self.log.delete_at(index, direction == Direction::Sent)?;
            writeln!(self.output, "Message deleted.")?;
        }
        Ok(())
    }

    fn prompt(&mut self, text: &str) -> Result<String> {
        write!(self.output, "{}", text)?;
        self.output.flush()?;
        Ok(self.read_line()?.unwrap_or_default())
    }

    /// One line without its terminator; `None` at end of input
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line).context("reading menu input")? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Sent => "sent",
        Direction::Received => "received",
    }
}
