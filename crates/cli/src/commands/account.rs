use geoflip_transform::session::{Credentials, SessionError};

use super::App;

pub async fn login(app: &mut App, email: String, password: String) -> anyhow::Result<()> {
    app.session.login(&Credentials::new(email, password)).await?;
    match app.session.state().user_id() {
        Some(id) => println!("Signed in (user {id})"),
        None => println!("Signed in"),
    }
    Ok(())
}

pub async fn logout(app: &mut App) -> anyhow::Result<()> {
    app.session.logout().await?;
    println!("Signed out");
    Ok(())
}

pub async fn usage(app: &mut App) -> anyhow::Result<()> {
    match app.session.monthly_usage(chrono::Utc::now()).await {
        Ok(remaining) => {
            println!("{remaining} transformations remaining this month");
            Ok(())
        }
        Err(SessionError::NotSignedIn) => anyhow::bail!("Not signed in; run `geoflip login` first"),
        Err(e) => Err(e.into()),
    }
}
