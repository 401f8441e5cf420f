use chrono::NaiveDate;
use fiscal_obligation_engine::*;
use std::collections::BTreeSet;
use uuid::Uuid;

fn tags(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn main() -> anyhow::Result<()> {
    println!("📅 Fiscal Obligation Monthly Run\n");

    let office = Organization {
        id: Uuid::new_v4(),
        name: "Contabilidade Ribeiro".to_string(),
        is_active: true,
        settings: OrganizationSettings::default(),
    };

    let clients = vec![
        Client {
            id: Uuid::new_v4(),
            name: "Padaria Central".to_string(),
            organization: office.id,
            fiscal_tags: tags(&["IVA_TRIMESTRAL"]),
            is_active: true,
            account_manager: None,
        },
        Client {
            id: Uuid::new_v4(),
            name: "Metalúrgica do Vale".to_string(),
            organization: office.id,
            fiscal_tags: tags(&["IVA_MENSAL", "EMPRESA"]),
            is_active: true,
            account_manager: None,
        },
    ];

    let mut monthly_vat = ObligationDefinition::new("IVA Mensal", Periodicity::Monthly);
    monthly_vat.deadline_day = 10;
    monthly_vat.deadline_month_offset = 2;
    monthly_vat.generation_trigger_offset_days = 20;
    monthly_vat.applies_to_client_tags = tags(&["IVA_MENSAL"]);

    let mut quarterly_vat = ObligationDefinition::new("IVA Trimestral", Periodicity::Quarterly);
    quarterly_vat.applies_to_client_tags = tags(&["IVA_TRIMESTRAL"]);

    let mut payroll = ObligationDefinition::new("DMR", Periodicity::Monthly);
    payroll.deadline_day = 10;
    payroll.generation_trigger_offset_days = 10;
    payroll.title_template = "{obligation_name} {month_name} {year} - {client_name}".to_string();
    payroll.applies_to_client_tags = tags(&["EMPRESA"]);

    let catalog = match std::env::args().nth(1) {
        Some(path) => {
            println!("📂 Loading catalog from {}\n", path);
            ObligationCatalog::from_json(&std::fs::read_to_string(path)?)?
        }
        None => ObligationCatalog {
            organizations: vec![office],
            clients,
            definitions: vec![monthly_vat, quarterly_vat, payroll],
            ..Default::default()
        },
    };

    let today = NaiveDate::from_ymd_opt(2024, 4, 8).unwrap_or_default();
    let store = InMemoryStore::new();
    let notifier = RecordingNotifier::new();
    let generator = FiscalObligationGenerator::new(&catalog, &store, &notifier)
        .with_options(GenerationOptions::new(today));

    println!("🔄 Generating from {} for the next 2 months...\n", today);
    for stats in generator.generate_for_next_months(2, None)? {
        println!("  {}", stats.summary());
        for error in &stats.errors {
            println!("    ⚠️  {}", error);
        }
    }

    println!("\n📋 Tasks:");
    for task in store.list_tasks(&TaskFilter::obligations())? {
        println!(
            "  {} | due {} | {}",
            task.obligation_period_key.as_deref().unwrap_or("-"),
            task.deadline.map(|d| d.to_string()).unwrap_or_default(),
            task.title
        );
    }

    println!("\n{}", generator.get_generation_stats(None)?.to_markdown());
    println!(
        "🔔 {} notifications recorded",
        notifier.events().len()
    );

    Ok(())
}
