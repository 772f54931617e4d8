//! Interface de linha de comando do ebloc baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, status,
//! replay) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ebloc: orquestrador do ciclo de vida de jobs num marketplace de computação.
#[derive(Debug, Parser)]
#[command(name = "ebloc", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: ebloc.toml no diretório atual).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa a demonstração embutida contra o ledger em memória.
    Demo,

    /// Reconstrói a projeção a partir do log e mostra o status dos jobs.
    Status {
        /// Mostra apenas este job.
        job_id: Option<String>,

        /// Log de eventos a ler (padrão: o da configuração).
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Reconstrói a projeção, reconcilia com o cache e regrava o cache.
    Replay {
        #[arg(long)]
        log: Option<PathBuf>,

        /// Cache da projeção (padrão: o da configuração).
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}
