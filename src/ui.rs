//! Interface de terminal do ebloc: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para as cores.
//! O [`JobProgress`] acompanha visualmente um job no terminal; as funções
//! livres imprimem tabelas de status e registros de auditoria.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::ids::JobId;
use crate::orchestrator::RecoveryReport;
use crate::state_machine::{AuditRecord, JobStatus, JobView};

/// Indicador visual de progresso de um job no terminal.
///
/// Exibe um spinner enquanto o job avança e mensagens coloridas para
/// liquidação (verde), falha (vermelho) e eventos intermediários (amarelo).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(job: &JobId, description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // Template fixo; um erro aqui só cairia no estilo padrão.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{} {description}", job.short()));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza o spinner com o rótulo atual do job (incluindo pendências).
    pub fn update(&self, view: &JobView) {
        self.pb
            .set_message(format!("{} {}", view.job.id.short(), view.label()));
    }

    /// Registra um evento intermediário acima do spinner.
    pub fn note(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    /// Finaliza o spinner e mostra o estado terminal do job.
    pub fn complete(&self, view: &JobView) {
        self.pb.finish_and_clear();
        match view.job.status {
            JobStatus::Settled => println!(
                "  {} Job {} settled",
                self.green.apply_to("✓"),
                view.job.id.short()
            ),
            status => println!(
                "  {} Job {} ended {status}",
                self.red.apply_to("✗"),
                view.job.id.short()
            ),
        }
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Settled => Style::new().green().bold(),
        JobStatus::Failed | JobStatus::Expired | JobStatus::Disputed => Style::new().red().bold(),
        JobStatus::Cancelled => Style::new().dim(),
        _ => Style::new().yellow(),
    }
}

/// Imprime o registro de auditoria em JSON com cabeçalho colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!(
        "{}",
        status_style(record.status).apply_to("─── Audit Record ───")
    );
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Imprime uma tabela com um job por linha.
pub fn print_jobs(views: &[JobView]) {
    if views.is_empty() {
        println!("No jobs in the event log.");
        return;
    }
    let bold = Style::new().bold();
    println!(
        "{}",
        bold.apply_to(format!(
            "{:<12} {:<34} {:>8} {:>8} {:<10}",
            "JOB", "STATUS", "ESCROW", "ATTEMPT", "PROVIDER"
        ))
    );
    for view in views {
        let job = &view.job;
        let provider = job.provider.as_ref().map(|p| p.as_str()).unwrap_or("-");
        println!(
            "{:<12} {} {:>8} {:>8} {:<10}",
            job.id.short(),
            status_style(job.status).apply_to(format!("{:<34}", view.label())),
            job.locked_amount(),
            job.attempt,
            provider
        );
    }
}

/// Imprime o detalhe de um job: estado, pendência, parada e histórico.
pub fn print_job(view: &JobView) {
    let job = &view.job;
    println!("Job      {}", job.id);
    println!("Owner    {}", job.spec.owner);
    println!("Status   {}", status_style(job.status).apply_to(view.label()));
    if let Some(reason) = &view.halted {
        println!("Halted   {}", Style::new().red().apply_to(reason));
    }
    let path: Vec<String> = job.history.iter().map(ToString::to_string).collect();
    println!("History  {}", path.join(" → "));
}

/// Resumo da reconciliação feita por `replay`.
pub fn print_recovery(report: &RecoveryReport) {
    println!(
        "Replayed {} events into {} jobs ({} active), cache {:?}, resume at block {}",
        report.events, report.jobs, report.active, report.cache, report.resume_from
    );
}
